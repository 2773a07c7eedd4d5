use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use igor_core::{IgorError, Result};

/// One search rule from the bootstrap file: object names matching the
/// regex are fetched relative to the base, which may be a directory or an
/// HTTP prefix
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRule {
    #[serde(rename = "nameRegex")]
    pub name_regex: String,
    #[serde(rename = "base")]
    pub base: String,
}

struct CompiledRule {
    regex: Regex,
    base: String,
}

/// Retrieves named configuration objects through the search rules, from
/// the filesystem or HTTP, with an instance-name overlay and a cache.
///
/// An object named `n` matching a rule with base `b` is first tried at
/// `b/<instance>/n`, then at `b/n`.
pub struct ConfigManager {
    instance_name: String,
    rules: Vec<CompiledRule>,
    cache: RwLock<HashMap<String, String>>,
}

impl ConfigManager {
    /// Build a manager from the bootstrap search rules file
    pub async fn from_bootstrap(bootstrap: &str, instance_name: &str) -> Result<Self> {
        let rules_text = read_resource(bootstrap).await?;
        Self::from_rules_text(&rules_text, instance_name)
    }

    /// Build a manager from the search rules JSON itself
    pub fn from_rules_text(rules_text: &str, instance_name: &str) -> Result<Self> {
        let rules: Vec<SearchRule> = serde_json::from_str(rules_text)
            .map_err(|e| IgorError::Config(format!("could not decode search rules: {e}")))?;
        if rules.is_empty() {
            return Err(IgorError::Config("empty search rules".to_string()));
        }

        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let regex = Regex::new(&rule.name_regex).map_err(|e| {
                IgorError::Config(format!("bad search rule regex {}: {e}", rule.name_regex))
            })?;
            compiled.push(CompiledRule {
                regex,
                base: rule.base,
            });
        }

        Ok(Self {
            instance_name: instance_name.to_string(),
            rules: compiled,
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Retrieve the raw text of a configuration object, from the cache if
    /// already fetched
    pub async fn get_object(&self, object_name: &str) -> Result<String> {
        if let Some(text) = self.cache.read().unwrap().get(object_name) {
            return Ok(text.clone());
        }

        let text = self.read_object(object_name).await?;
        self.cache
            .write()
            .unwrap()
            .insert(object_name.to_string(), text.clone());
        Ok(text)
    }

    /// Retrieve and deserialize a JSON configuration object
    pub async fn get_json_object<T>(&self, object_name: &str) -> Result<T>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let text = self.get_object(object_name).await?;
        serde_json::from_str(&text)
            .map_err(|e| IgorError::Config(format!("could not decode {object_name}: {e}")))
    }

    /// Remove an object from the cache so the next access re-reads it
    pub fn invalidate(&self, object_name: &str) {
        self.cache.write().unwrap().remove(object_name);
    }

    async fn read_object(&self, object_name: &str) -> Result<String> {
        let (base, inner_name) = self
            .rules
            .iter()
            .find_map(|rule| {
                rule.regex
                    .captures(object_name)
                    .and_then(|captures| captures.get(1))
                    .map(|m| (rule.base.as_str(), m.as_str()))
            })
            .ok_or_else(|| {
                IgorError::Config(format!("object name {object_name} does not match any rule"))
            })?;

        // Instance specific objects take precedence
        if !self.instance_name.is_empty() {
            let location = format!("{}{}/{}", base, self.instance_name, inner_name);
            if let Ok(text) = read_resource(&location).await {
                return Ok(text);
            }
        }

        read_resource(&format!("{base}{inner_name}")).await
    }
}

/// Read a resource from a location, which may be a file path or an HTTP
/// URL
pub async fn read_resource(location: &str) -> Result<String> {
    if location.starts_with("http") {
        let response = reqwest::get(location)
            .await
            .map_err(|e| IgorError::Config(format!("could not fetch {location}: {e}")))?;
        response
            .error_for_status()
            .map_err(|e| IgorError::Config(format!("could not fetch {location}: {e}")))?
            .text()
            .await
            .map_err(|e| IgorError::Config(format!("could not read {location}: {e}")))
    } else {
        debug!(file = location, "reading configuration file");
        let path = PathBuf::from(location);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| IgorError::Config(format!("could not read {location}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_object_resolution() {
        let dir = std::env::temp_dir().join("igor-config-test");
        tokio::fs::create_dir_all(dir.join("testInstance"))
            .await
            .unwrap();
        tokio::fs::write(dir.join("global.json"), r#"{"scope": "global"}"#)
            .await
            .unwrap();
        tokio::fs::write(
            dir.join("testInstance").join("local.json"),
            r#"{"scope": "instance"}"#,
        )
        .await
        .unwrap();

        let rules = format!(
            r#"[{{"nameRegex": "(.*)", "base": "{}/"}}]"#,
            dir.to_str().unwrap()
        );
        let manager = ConfigManager::from_rules_text(&rules, "testInstance").unwrap();

        // Falls back to the base location
        let text = manager.get_object("global.json").await.unwrap();
        assert!(text.contains("global"));

        // Instance overlay wins
        let text = manager.get_object("local.json").await.unwrap();
        assert!(text.contains("instance"));

        assert!(manager.get_object("missing.json").await.is_err());
    }

    #[tokio::test]
    async fn test_cache_and_invalidate() {
        let dir = std::env::temp_dir().join("igor-config-cache-test");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("object.json");
        tokio::fs::write(&path, "first").await.unwrap();

        let rules = format!(
            r#"[{{"nameRegex": "(.*)", "base": "{}/"}}]"#,
            dir.to_str().unwrap()
        );
        let manager = ConfigManager::from_rules_text(&rules, "").unwrap();

        assert_eq!(manager.get_object("object.json").await.unwrap(), "first");

        tokio::fs::write(&path, "second").await.unwrap();
        // Still cached
        assert_eq!(manager.get_object("object.json").await.unwrap(), "first");

        manager.invalidate("object.json");
        assert_eq!(manager.get_object("object.json").await.unwrap(), "second");
    }

    #[test]
    fn test_bad_rules() {
        assert!(ConfigManager::from_rules_text("[]", "").is_err());
        assert!(ConfigManager::from_rules_text("not json", "").is_err());
        assert!(
            ConfigManager::from_rules_text(r#"[{"nameRegex": "(", "base": "/"}]"#, "").is_err()
        );
    }
}
