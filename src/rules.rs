use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Trigger value that puts a rule in force from session creation.
pub const TRIGGER_ALWAYS: &str = "always";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleMode {
    Approve,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    pub id: String,
    /// `"always"`, or a plain-English condition over the session history.
    pub trigger: String,
    /// Plain-English description of which operations the rule restricts.
    pub effect: String,
    pub mode: RuleMode,
    #[serde(default)]
    pub description: String,
}

impl Rule {
    pub fn is_always(&self) -> bool {
        self.trigger == TRIGGER_ALWAYS
    }
}

/// Immutable, validated snapshot of the rule file. Order is file order and
/// is the tiebreak used everywhere rules are reported.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RuleSet {
    #[serde(default)]
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn from_str(content: &str) -> Result<Self> {
        let set: RuleSet = serde_yml::from_str(content).context("failed to parse rule file")?;
        set.validate()?;
        Ok(set)
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(RuleSet::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read rules at {}", path.display()))?;
        Self::from_str(&content)
            .with_context(|| format!("invalid rule file at {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.id.trim().is_empty() {
                bail!("rule with empty id");
            }
            if !seen.insert(rule.id.as_str()) {
                bail!("duplicate rule id: {}", rule.id);
            }
            if rule.trigger.trim().is_empty() {
                bail!("rule '{}' has an empty trigger", rule.id);
            }
            if rule.effect.trim().is_empty() {
                bail!("rule '{}' has an empty effect", rule.id);
            }
        }
        Ok(())
    }

    pub fn all(&self) -> &[Rule] {
        &self.rules
    }

    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    #[allow(dead_code)]
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yml::to_string(self)?)
    }
}

/// Process-wide rule snapshot holder. Readers clone the `Arc`; reload swaps
/// the pointer only after the new file parses, so a running system never
/// observes a partial set.
pub struct RuleStore {
    path: PathBuf,
    current: RwLock<Arc<RuleSet>>,
}

impl RuleStore {
    pub fn load(path: PathBuf) -> Result<Self> {
        let set = RuleSet::load(&path)?;
        info!("Loaded {} rule(s) from {}", set.len(), path.display());
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(set)),
        })
    }

    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.read().expect("rule store lock poisoned").clone()
    }

    /// Re-read the rule file. On failure the previous snapshot stays
    /// published and the error is returned.
    pub fn reload(&self) -> Result<usize> {
        match RuleSet::load(&self.path) {
            Ok(set) => {
                let count = set.len();
                *self.current.write().expect("rule store lock poisoned") = Arc::new(set);
                info!("Reloaded {} rule(s)", count);
                Ok(count)
            }
            Err(e) => {
                warn!("Rule reload failed, keeping previous set: {e:#}");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
rules:
  - id: no-write-after-web
    trigger: agent has read from the internet
    effect: block writes without approval
    mode: approve
    description: Writes need approval once the agent has been online.
  - id: skill-modification
    trigger: always
    effect: writes under skills/ need approval
    mode: approve
  - id: no-credential-exfil
    trigger: agent has accessed a credential
    effect: block outbound network writes
    mode: block
";

    #[test]
    fn test_parse_and_order() {
        let set = RuleSet::from_str(SAMPLE).unwrap();
        assert_eq!(set.len(), 3);
        let ids: Vec<&str> = set.all().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["no-write-after-web", "skill-modification", "no-credential-exfil"]
        );
        assert!(set.get("skill-modification").unwrap().is_always());
        assert_eq!(set.get("no-credential-exfil").unwrap().mode, RuleMode::Block);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let bad = "rules:\n  - {id: a, trigger: always, effect: x, mode: approve}\n  - {id: a, trigger: always, effect: y, mode: block}\n";
        assert!(RuleSet::from_str(bad).is_err());
    }

    #[test]
    fn test_empty_trigger_rejected() {
        let bad = "rules:\n  - {id: a, trigger: \"\", effect: x, mode: approve}\n";
        assert!(RuleSet::from_str(bad).is_err());
    }

    #[test]
    fn test_bad_mode_rejected() {
        let bad = "rules:\n  - {id: a, trigger: always, effect: x, mode: maybe}\n";
        assert!(RuleSet::from_str(bad).is_err());
    }

    #[test]
    fn test_missing_file_is_empty_set() {
        let set = RuleSet::load(Path::new("/nonexistent/rules.yaml")).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_serialise_roundtrip_identity() {
        let set = RuleSet::from_str(SAMPLE).unwrap();
        let yaml = set.to_yaml().unwrap();
        let reparsed = RuleSet::from_str(&yaml).unwrap();
        assert_eq!(set, reparsed);
    }

    #[test]
    fn test_store_reload_keeps_old_set_on_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rules.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        let store = RuleStore::load(path.clone()).unwrap();
        assert_eq!(store.snapshot().len(), 3);

        std::fs::write(&path, "rules:\n  - {id: a, trigger: always}\n").unwrap();
        assert!(store.reload().is_err());
        // Previous snapshot still published.
        assert_eq!(store.snapshot().len(), 3);

        std::fs::write(&path, "rules:\n  - {id: a, trigger: always, effect: x, mode: block}\n")
            .unwrap();
        assert_eq!(store.reload().unwrap(), 1);
        assert_eq!(store.snapshot().len(), 1);
    }
}
