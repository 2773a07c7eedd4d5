use std::sync::atomic::{AtomicUsize, Ordering};

use igor_config::{RoutePolicy, RoutingRuleConfig};
use igor_dict::DiameterDictionary;

/// One routing rule plus its round-robin cursor
pub struct Rule {
    pub config: RoutingRuleConfig,
    cursor: AtomicUsize,
}

impl Rule {
    fn matches(&self, realm: &str, application_id: u32, dict: &DiameterDictionary) -> bool {
        if self.config.realm != "*" && self.config.realm != realm {
            return false;
        }
        if self.config.application_id == "*" {
            return true;
        }
        dict.app_by_name(&self.config.application_id)
            .map(|app| app.code == application_id)
            .unwrap_or(false)
    }

    /// Handler peers in the order they should be tried. Fixed policy scans
    /// from the first declared peer; round-robin advances a per-rule
    /// cursor with wraparound.
    pub fn candidates(&self) -> Vec<&str> {
        let peers = &self.config.peers;
        if peers.is_empty() {
            return Vec::new();
        }
        let start = match self.config.policy {
            RoutePolicy::Fixed => 0,
            RoutePolicy::RoundRobin => self.cursor.fetch_add(1, Ordering::Relaxed) % peers.len(),
        };
        (0..peers.len())
            .map(|i| peers[(start + i) % peers.len()].as_str())
            .collect()
    }
}

/// The ordered routing rule list. The first matching rule wins.
pub struct RoutingRules {
    rules: Vec<Rule>,
}

impl RoutingRules {
    pub fn new(configs: Vec<RoutingRuleConfig>) -> Self {
        Self {
            rules: configs
                .into_iter()
                .map(|config| Rule {
                    config,
                    cursor: AtomicUsize::new(0),
                })
                .collect(),
        }
    }

    pub fn find(
        &self,
        realm: &str,
        application_id: u32,
        dict: &DiameterDictionary,
    ) -> Option<&Rule> {
        self.rules
            .iter()
            .find(|rule| rule.matches(realm, application_id, dict))
    }
}

/// Application codes to advertise in CER/CEA, derived from the routing
/// rules: every named application contributes its code to the auth or
/// acct list per its type
pub fn advertised_applications(
    configs: &[RoutingRuleConfig],
    dict: &DiameterDictionary,
) -> (Vec<u32>, Vec<u32>) {
    let mut auth = Vec::new();
    let mut acct = Vec::new();
    for config in configs {
        if config.application_id == "*" {
            continue;
        }
        if let Ok(app) = dict.app_by_name(&config.application_id) {
            let list = if app.app_type.contains("acct") {
                &mut acct
            } else {
                &mut auth
            };
            if !list.contains(&app.code) {
                list.push(app.code);
            }
        }
    }
    (auth, acct)
}
