use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use igor_core::{IgorError, Result};

/// Diameter AVP data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum DiameterType {
    OctetString,
    UTF8String,
    Integer32,
    Integer64,
    Unsigned32,
    Unsigned64,
    Float32,
    Float64,
    Address,
    Time,
    DiameterIdentity,
    DiameterURI,
    IPFilterRule,
    IPv4Address,
    IPv6Address,
    IPv6Prefix,
    Enumerated,
    Grouped,
}

/// Occurrence bounds for one AVP inside a group or command schema
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Occurs {
    #[serde(rename = "MinOccurs", default)]
    pub min_occurs: u32,
    #[serde(rename = "MaxOccurs", default = "default_max_occurs")]
    pub max_occurs: u32,
}

fn default_max_occurs() -> u32 {
    u32::MAX
}

/// Dictionary entry for one Diameter AVP
#[derive(Debug, Clone)]
pub struct DiameterAvpDef {
    pub code: u32,
    pub vendor_id: u32,
    pub name: String,
    pub data_type: DiameterType,
    /// Enumerated value names, both directions
    pub enum_values: HashMap<String, i32>,
    pub enum_names: HashMap<i32, String>,
    /// Child schema for Grouped AVPs, child name to occurrence bounds
    pub group: HashMap<String, Occurs>,
}

impl DiameterAvpDef {
    /// Synthetic entry for an AVP received on the wire but not present in
    /// the dictionary. Vendor and code are retained so that re-encoding
    /// round-trips the original bytes.
    pub fn unknown(vendor_id: u32, code: u32) -> Arc<Self> {
        Arc::new(Self {
            code,
            vendor_id,
            name: "UNKNOWN".to_string(),
            data_type: DiameterType::OctetString,
            enum_values: HashMap::new(),
            enum_names: HashMap::new(),
            group: HashMap::new(),
        })
    }

    pub fn is_unknown(&self) -> bool {
        self.name == "UNKNOWN"
    }
}

/// Diameter application entry
#[derive(Debug, Clone)]
pub struct DiameterApplication {
    pub code: u32,
    pub name: String,
    /// "auth", "acct" or empty
    pub app_type: String,
}

/// Command entry with the request and answer schemas
#[derive(Debug, Clone)]
pub struct CommandDef {
    pub code: u32,
    pub name: String,
    pub request: HashMap<String, Occurs>,
    pub answer: HashMap<String, Occurs>,
}

// Serde model for the JSON dictionary file

#[derive(Deserialize)]
struct JDictionary {
    #[serde(rename = "Vendors", default)]
    _vendors: Vec<JVendor>,
    #[serde(rename = "Avps", default)]
    avps: Vec<JAvp>,
    #[serde(rename = "Applications", default)]
    applications: Vec<JApplication>,
    #[serde(rename = "Commands", default)]
    commands: Vec<JCommand>,
}

#[derive(Deserialize)]
struct JVendor {
    #[serde(rename = "VendorId")]
    _vendor_id: u32,
    #[serde(rename = "Name")]
    _name: String,
}

#[derive(Deserialize)]
struct JAvp {
    #[serde(rename = "Code")]
    code: u32,
    #[serde(rename = "VendorId", default)]
    vendor_id: u32,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Type")]
    data_type: DiameterType,
    #[serde(rename = "EnumValues", default)]
    enum_values: HashMap<String, i32>,
    #[serde(rename = "Group", default)]
    group: HashMap<String, Occurs>,
}

#[derive(Deserialize)]
struct JApplication {
    #[serde(rename = "Code")]
    code: u32,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "AppType", default)]
    app_type: String,
}

#[derive(Deserialize)]
struct JCommand {
    #[serde(rename = "Code")]
    code: u32,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Request", default)]
    request: Vec<HashMap<String, Occurs>>,
    #[serde(rename = "Answer", default)]
    answer: Vec<HashMap<String, Occurs>>,
}

/// Immutable Diameter dictionary. Built once from JSON, shared by Arc.
#[derive(Debug, Default)]
pub struct DiameterDictionary {
    avps_by_name: HashMap<String, Arc<DiameterAvpDef>>,
    avps_by_code: HashMap<(u32, u32), Arc<DiameterAvpDef>>,
    apps_by_name: HashMap<String, Arc<DiameterApplication>>,
    apps_by_code: HashMap<u32, Arc<DiameterApplication>>,
    commands_by_name: HashMap<String, Arc<CommandDef>>,
    commands_by_code: HashMap<u32, Arc<CommandDef>>,
}

impl DiameterDictionary {
    /// Build a dictionary from the JSON schema with top level keys
    /// Vendors, Avps, Applications and Commands
    pub fn from_json(text: &str) -> Result<Self> {
        let jdict: JDictionary =
            serde_json::from_str(text).map_err(|e| IgorError::Config(e.to_string()))?;

        let mut dict = DiameterDictionary::default();

        for javp in jdict.avps {
            let enum_names = javp
                .enum_values
                .iter()
                .map(|(name, code)| (*code, name.clone()))
                .collect();
            let def = Arc::new(DiameterAvpDef {
                code: javp.code,
                vendor_id: javp.vendor_id,
                name: javp.name.clone(),
                data_type: javp.data_type,
                enum_values: javp.enum_values,
                enum_names,
                group: javp.group,
            });
            if dict
                .avps_by_name
                .insert(javp.name.clone(), def.clone())
                .is_some()
            {
                return Err(IgorError::Config(format!("duplicate AVP name {}", javp.name)));
            }
            if dict
                .avps_by_code
                .insert((javp.vendor_id, javp.code), def)
                .is_some()
            {
                return Err(IgorError::Config(format!(
                    "duplicate AVP code {} for vendor {}",
                    javp.code, javp.vendor_id
                )));
            }
        }

        for japp in jdict.applications {
            let app = Arc::new(DiameterApplication {
                code: japp.code,
                name: japp.name.clone(),
                app_type: japp.app_type,
            });
            dict.apps_by_name.insert(japp.name, app.clone());
            dict.apps_by_code.insert(japp.code, app);
        }

        for jcommand in jdict.commands {
            let command = Arc::new(CommandDef {
                code: jcommand.code,
                name: jcommand.name.clone(),
                request: flatten_schema(jcommand.request),
                answer: flatten_schema(jcommand.answer),
            });
            dict.commands_by_name.insert(jcommand.name, command.clone());
            dict.commands_by_code.insert(jcommand.code, command);
        }

        Ok(dict)
    }

    /// Lookup an AVP definition by name
    pub fn avp_by_name(&self, name: &str) -> Result<Arc<DiameterAvpDef>> {
        self.avps_by_name
            .get(name)
            .cloned()
            .ok_or_else(|| IgorError::UnknownAttribute(name.to_string()))
    }

    /// Lookup an AVP definition by vendor and code. Never fails: codes not
    /// in the dictionary get a synthetic UNKNOWN entry.
    pub fn avp_by_code(&self, vendor_id: u32, code: u32) -> Arc<DiameterAvpDef> {
        self.avps_by_code
            .get(&(vendor_id, code))
            .cloned()
            .unwrap_or_else(|| DiameterAvpDef::unknown(vendor_id, code))
    }

    pub fn app_by_name(&self, name: &str) -> Result<Arc<DiameterApplication>> {
        self.apps_by_name
            .get(name)
            .cloned()
            .ok_or_else(|| IgorError::UnknownAttribute(name.to_string()))
    }

    pub fn app_by_code(&self, code: u32) -> Option<Arc<DiameterApplication>> {
        self.apps_by_code.get(&code).cloned()
    }

    pub fn command_by_name(&self, name: &str) -> Result<Arc<CommandDef>> {
        self.commands_by_name
            .get(name)
            .cloned()
            .ok_or_else(|| IgorError::UnknownAttribute(name.to_string()))
    }

    pub fn command_by_code(&self, code: u32) -> Option<Arc<CommandDef>> {
        self.commands_by_code.get(&code).cloned()
    }

    /// All configured applications
    pub fn applications(&self) -> impl Iterator<Item = &Arc<DiameterApplication>> {
        self.apps_by_code.values()
    }
}

// The JSON schema writes command schemas as a list of single-key objects
// to keep the declared order readable. Occurrence checking does not need
// the order, so they collapse into one map.
fn flatten_schema(entries: Vec<HashMap<String, Occurs>>) -> HashMap<String, Occurs> {
    let mut schema = HashMap::new();
    for entry in entries {
        for (name, occurs) in entry {
            schema.insert(name, occurs);
        }
    }
    schema
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_DICT: &str = r#"{
        "Vendors": [{"VendorId": 9001, "Name": "Igor"}],
        "Avps": [
            {"Code": 263, "Name": "Session-Id", "Type": "UTF8String"},
            {"Code": 264, "Name": "Origin-Host", "Type": "DiameterIdentity"},
            {"Code": 1, "VendorId": 9001, "Name": "Igor-myEnumerated", "Type": "Enumerated",
             "EnumValues": {"zero": 0, "one": 1, "two": 2}},
            {"Code": 2, "VendorId": 9001, "Name": "Igor-myGrouped", "Type": "Grouped",
             "Group": {"Session-Id": {"MinOccurs": 1, "MaxOccurs": 1}}}
        ],
        "Applications": [
            {"Code": 0, "Name": "Base", "AppType": "auth"},
            {"Code": 1000, "Name": "TestApplication", "AppType": "auth"}
        ],
        "Commands": [
            {"Code": 2000, "Name": "TestRequest",
             "Request": [{"Session-Id": {"MinOccurs": 1, "MaxOccurs": 1}}],
             "Answer": [{"Session-Id": {"MinOccurs": 1, "MaxOccurs": 1}}]}
        ]
    }"#;

    #[test]
    fn test_lookup_by_name_and_code() {
        let dict = DiameterDictionary::from_json(TEST_DICT).unwrap();

        let def = dict.avp_by_name("Origin-Host").unwrap();
        assert_eq!(def.code, 264);
        assert_eq!(def.data_type, DiameterType::DiameterIdentity);

        let def = dict.avp_by_code(9001, 1);
        assert_eq!(def.name, "Igor-myEnumerated");
        assert_eq!(def.enum_names.get(&2).unwrap(), "two");
    }

    #[test]
    fn test_unknown_avp_is_synthetic() {
        let dict = DiameterDictionary::from_json(TEST_DICT).unwrap();

        assert!(dict.avp_by_name("No-Such-Avp").is_err());

        let def = dict.avp_by_code(11, 99);
        assert!(def.is_unknown());
        assert_eq!(def.vendor_id, 11);
        assert_eq!(def.code, 99);
        assert_eq!(def.data_type, DiameterType::OctetString);
    }

    #[test]
    fn test_command_schema() {
        let dict = DiameterDictionary::from_json(TEST_DICT).unwrap();

        let command = dict.command_by_name("TestRequest").unwrap();
        assert_eq!(command.code, 2000);
        let occurs = command.request.get("Session-Id").unwrap();
        assert_eq!(occurs.min_occurs, 1);
        assert_eq!(occurs.max_occurs, 1);

        assert!(dict.command_by_code(9999).is_none());
    }

    #[test]
    fn test_duplicate_name_fails() {
        let text = r#"{
            "Avps": [
                {"Code": 1, "Name": "Dup", "Type": "Unsigned32"},
                {"Code": 2, "Name": "Dup", "Type": "Unsigned32"}
            ]
        }"#;
        assert!(DiameterDictionary::from_json(text).is_err());
    }
}
