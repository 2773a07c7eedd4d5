use std::collections::HashMap;
use std::sync::Arc;

use igor_core::{IgorError, Result};

/// RADIUS attribute data type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadiusType {
    Octets,
    String,
    Integer,
    Integer64,
    Address,
    Time,
    IPv6Address,
    IPv6Prefix,
    InterfaceId,
    /// Container type in FreeRADIUS dictionaries, filtered out at load
    Vsa,
}

/// Dictionary entry for one RADIUS attribute
#[derive(Debug, Clone)]
pub struct RadiusAvpDef {
    pub code: u8,
    pub vendor_id: u32,
    pub name: String,
    pub radius_type: RadiusType,
    /// RFC 2868 tag byte
    pub tagged: bool,
    /// User-Password cipher
    pub encrypted: bool,
    /// Salt plus cipher
    pub salted: bool,
    /// Length prefix inside the cipher payload
    pub withlen: bool,
    pub enum_values: HashMap<String, u32>,
    pub enum_names: HashMap<u32, String>,
}

impl RadiusAvpDef {
    /// Synthetic entry for an attribute received on the wire but not
    /// present in the dictionary
    pub fn unknown(vendor_id: u32, code: u8) -> Arc<Self> {
        Arc::new(Self {
            code,
            vendor_id,
            name: "UNKNOWN".to_string(),
            radius_type: RadiusType::Octets,
            tagged: false,
            encrypted: false,
            salted: false,
            withlen: false,
            enum_values: HashMap::new(),
            enum_names: HashMap::new(),
        })
    }

    pub fn is_unknown(&self) -> bool {
        self.name == "UNKNOWN"
    }
}

/// Immutable RADIUS dictionary. Built by the FreeRADIUS grammar parser,
/// shared by Arc.
#[derive(Debug, Default)]
pub struct RadiusDictionary {
    pub(crate) avps_by_name: HashMap<String, Arc<RadiusAvpDef>>,
    pub(crate) avps_by_code: HashMap<(u32, u8), Arc<RadiusAvpDef>>,
    pub(crate) vendors_by_name: HashMap<String, u32>,
}

impl RadiusDictionary {
    /// Lookup an attribute definition by name
    pub fn avp_by_name(&self, name: &str) -> Result<Arc<RadiusAvpDef>> {
        self.avps_by_name
            .get(name)
            .cloned()
            .ok_or_else(|| IgorError::UnknownAttribute(name.to_string()))
    }

    /// Lookup an attribute definition by vendor and code. Never fails:
    /// codes not in the dictionary get a synthetic UNKNOWN entry.
    pub fn avp_by_code(&self, vendor_id: u32, code: u8) -> Arc<RadiusAvpDef> {
        self.avps_by_code
            .get(&(vendor_id, code))
            .cloned()
            .unwrap_or_else(|| RadiusAvpDef::unknown(vendor_id, code))
    }

    pub fn vendor_by_name(&self, name: &str) -> Option<u32> {
        self.vendors_by_name.get(name).copied()
    }
}
