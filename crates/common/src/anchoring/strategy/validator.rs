use std::fmt::Debug;

use crate::brick_map::{BrickMap, BrickMapDiff};

/// Checks loaded history before it is trusted
pub trait HistoryValidator: Debug + Send + Sync {
    /// Validate a diff anchored right after `previous`
    fn validate_diff(
        &self,
        previous: Option<&str>,
        hash: &str,
        diff: &BrickMapDiff,
    ) -> anyhow::Result<()>;

    fn validate_snapshot(&self, _hash: &str, _tree: &BrickMap) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Trust whatever the alias points at
#[derive(Debug, Clone, Default)]
pub struct AcceptAll;

impl HistoryValidator for AcceptAll {
    fn validate_diff(&self, _: Option<&str>, _: &str, _: &BrickMapDiff) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Require every diff to name its predecessor in `prev`
///
/// Catches histories where a diff was anchored on top of a version other
/// than the one it was written against.
#[derive(Debug, Clone, Default)]
pub struct ChainValidator;

impl ChainValidator {
    pub fn new() -> Self {
        Self
    }
}

impl HistoryValidator for ChainValidator {
    fn validate_diff(
        &self,
        previous: Option<&str>,
        hash: &str,
        diff: &BrickMapDiff,
    ) -> anyhow::Result<()> {
        if diff.prev() != previous {
            anyhow::bail!(
                "diff {} chains onto {:?} but follows {:?}",
                hash,
                diff.prev(),
                previous
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_chain_validator() {
        let validator = ChainValidator::new();
        assert!(validator
            .validate_diff(None, "h1", &BrickMapDiff::new(None))
            .is_ok());
        assert!(validator
            .validate_diff(Some("h1"), "h2", &BrickMapDiff::new(Some("h1".into())))
            .is_ok());
        assert!(validator
            .validate_diff(Some("h1"), "h2", &BrickMapDiff::new(Some("h0".into())))
            .is_err());
        assert!(validator
            .validate_snapshot("h", &BrickMap::new())
            .is_ok());
    }
}
