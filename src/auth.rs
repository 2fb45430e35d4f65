use anyhow::{Context, Result};
use rand::distr::Alphanumeric;
use rand::RngExt;
use std::fs;
use std::path::Path;
use tracing::info;

const TOKEN_LEN: usize = 48;

/// Load the bearer token, generating one on first start. The file is
/// created mode 0600: the token is the only thing standing between the
/// network and the gateway.
pub fn load_or_generate_token(path: &Path) -> Result<String> {
    if path.exists() {
        let token = fs::read_to_string(path)
            .with_context(|| format!("failed to read token at {}", path.display()))?;
        let token = token.trim().to_string();
        if !token.is_empty() {
            return Ok(token);
        }
    }

    let token: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, &token)
        .with_context(|| format!("failed to write token at {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    info!("Generated server token at {}", path.display());
    Ok(token)
}

/// Check an `Authorization` header value (or bare token) against the
/// server token.
pub fn check_bearer(expected: &str, presented: Option<&str>) -> bool {
    let Some(presented) = presented else {
        return false;
    };
    let candidate = presented
        .strip_prefix("Bearer ")
        .unwrap_or(presented)
        .trim();
    !expected.is_empty() && candidate == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_then_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("server.token");
        let token = load_or_generate_token(&path).unwrap();
        assert_eq!(token.len(), TOKEN_LEN);

        let again = load_or_generate_token(&path).unwrap();
        assert_eq!(token, again);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_check_bearer() {
        assert!(check_bearer("secret", Some("Bearer secret")));
        assert!(check_bearer("secret", Some("secret")));
        assert!(!check_bearer("secret", Some("Bearer wrong")));
        assert!(!check_bearer("secret", None));
        assert!(!check_bearer("", Some("")));
    }
}
