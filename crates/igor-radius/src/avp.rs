use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use igor_core::constants::RADIUS_VENDOR_SPECIFIC;
use igor_core::{IgorError, Result};
use igor_dict::{RadiusAvpDef, RadiusDictionary, RadiusType};

use crate::cipher;

/// Decoded RADIUS attribute value
#[derive(Debug, Clone, PartialEq)]
pub enum RadiusValue {
    Octets(Vec<u8>),
    String(String),
    Integer(u32),
    Integer64(u64),
    Address(Ipv4Addr),
    /// Seconds since 1970-01-01 UTC
    Time(u32),
    IPv6Address(Ipv6Addr),
    IPv6Prefix { prefix_len: u8, prefix: Ipv6Addr },
    InterfaceId([u8; 8]),
}

impl From<&str> for RadiusValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for RadiusValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for RadiusValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Octets(v)
    }
}

impl From<&[u8]> for RadiusValue {
    fn from(v: &[u8]) -> Self {
        Self::Octets(v.to_vec())
    }
}

impl From<u32> for RadiusValue {
    fn from(v: u32) -> Self {
        Self::Integer(v)
    }
}

impl From<u64> for RadiusValue {
    fn from(v: u64) -> Self {
        Self::Integer64(v)
    }
}

impl From<Ipv4Addr> for RadiusValue {
    fn from(v: Ipv4Addr) -> Self {
        Self::Address(v)
    }
}

impl From<Ipv6Addr> for RadiusValue {
    fn from(v: Ipv6Addr) -> Self {
        Self::IPv6Address(v)
    }
}

/// One RADIUS attribute: dictionary entry, optional RFC 2868 tag and the
/// decoded (plaintext) value
#[derive(Debug, Clone)]
pub struct RadiusAvp {
    pub def: Arc<RadiusAvpDef>,
    pub tag: Option<u8>,
    pub value: RadiusValue,
}

impl PartialEq for RadiusAvp {
    fn eq(&self, other: &Self) -> bool {
        self.def.code == other.def.code
            && self.def.vendor_id == other.def.vendor_id
            && self.tag == other.tag
            && self.value == other.value
    }
}

impl RadiusAvp {
    /// Create an attribute by dictionary name. For tagged attributes a
    /// string value may carry the tag as a `value:tag` suffix.
    pub fn new(
        name: &str,
        value: impl Into<RadiusValue>,
        dict: &RadiusDictionary,
    ) -> Result<Self> {
        let def = dict.avp_by_name(name)?;

        let mut value = value.into();
        let mut tag = if def.tagged { Some(0) } else { None };
        if def.tagged {
            if let RadiusValue::String(s) = &value {
                if let Some((body, tag_str)) = s.rsplit_once(':') {
                    if let Ok(parsed) = tag_str.parse::<u8>() {
                        tag = Some(parsed);
                        value = RadiusValue::String(body.to_string());
                    }
                }
            }
        }

        let value = coerce(value, &def)?;
        Ok(Self { def, tag, value })
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn code(&self) -> u8 {
        self.def.code
    }

    pub fn vendor_id(&self) -> u32 {
        self.def.vendor_id
    }

    pub fn as_int(&self) -> Option<i64> {
        match &self.value {
            RadiusValue::Integer(v) => Some(*v as i64),
            RadiusValue::Integer64(v) => Some(*v as i64),
            RadiusValue::Time(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_octets(&self) -> Option<&[u8]> {
        match &self.value {
            RadiusValue::Octets(v) => Some(v),
            _ => None,
        }
    }

    /// Value with trailing cipher padding removed, as a string
    pub fn as_password_string(&self) -> Result<String> {
        match &self.value {
            RadiusValue::Octets(v) => {
                let end = v.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
                String::from_utf8(v[..end].to_vec())
                    .map_err(|_| IgorError::Decode(format!("invalid UTF-8 in {}", self.def.name)))
            }
            RadiusValue::String(s) => Ok(s.trim_end_matches('\0').to_string()),
            _ => Err(IgorError::Internal(format!(
                "{} is not a text attribute",
                self.def.name
            ))),
        }
    }

    /// String rendering including the tag, `value:tag`
    pub fn tagged_string(&self) -> String {
        match self.tag {
            Some(tag) => format!("{}:{}", self, tag),
            None => self.to_string(),
        }
    }

    /// Serialize one attribute. The authenticator keys the encrypted and
    /// salted transforms.
    pub fn to_bytes(&self, authenticator: &[u8; 16], secret: &str) -> Result<Vec<u8>> {
        let mut data = encode_value(&self.value);

        if self.def.encrypted {
            data = cipher::encrypt(&data, authenticator, secret, None);
        } else if self.def.salted {
            data = cipher::encrypt_salted(&data, authenticator, secret, self.def.withlen);
        }

        if self.def.tagged {
            let tag = self.tag.unwrap_or(0);
            if self.def.radius_type == RadiusType::Integer && !self.def.salted {
                // Tag replaces the high byte of the integer
                data[0] = tag;
            } else {
                data.insert(0, tag);
            }
        }

        let mut bytes = Vec::with_capacity(data.len() + 8);
        if self.def.vendor_id == 0 {
            let length = data.len() + 2;
            if length > 255 {
                return Err(IgorError::Internal(format!(
                    "attribute {} too long: {length}",
                    self.def.name
                )));
            }
            bytes.push(self.def.code);
            bytes.push(length as u8);
            bytes.extend_from_slice(&data);
        } else {
            let length = data.len() + 8;
            if length > 255 {
                return Err(IgorError::Internal(format!(
                    "attribute {} too long: {length}",
                    self.def.name
                )));
            }
            bytes.push(RADIUS_VENDOR_SPECIFIC);
            bytes.push(length as u8);
            bytes.extend_from_slice(&self.def.vendor_id.to_be_bytes());
            bytes.push(self.def.code);
            bytes.push((data.len() + 2) as u8);
            bytes.extend_from_slice(&data);
        }

        Ok(bytes)
    }

    /// Parse one attribute, decrypting as the dictionary flags dictate.
    /// Returns the attribute and the number of bytes consumed.
    pub fn from_bytes(
        data: &[u8],
        authenticator: &[u8; 16],
        secret: &str,
        dict: &RadiusDictionary,
    ) -> Result<(Self, usize)> {
        if data.len() < 2 {
            return Err(IgorError::Decode("attribute header too short".to_string()));
        }
        let attr_type = data[0];
        let length = data[1] as usize;
        if length < 2 || data.len() < length {
            return Err(IgorError::Decode(format!(
                "invalid attribute length {length} for type {attr_type}"
            )));
        }

        let (def, mut payload) = if attr_type == RADIUS_VENDOR_SPECIFIC {
            if length < 8 {
                return Err(IgorError::Decode("vendor attribute too short".to_string()));
            }
            let vendor_id = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
            let vendor_type = data[6];
            let vendor_length = data[7] as usize;
            if vendor_length < 2 || 6 + vendor_length != length {
                return Err(IgorError::Decode(format!(
                    "invalid vendor attribute length {vendor_length}"
                )));
            }
            (dict.avp_by_code(vendor_id, vendor_type), data[8..length].to_vec())
        } else {
            (dict.avp_by_code(0, attr_type), data[2..length].to_vec())
        };

        let mut tag = None;
        if def.tagged {
            if def.radius_type == RadiusType::Integer && !def.salted {
                if payload.is_empty() {
                    return Err(IgorError::Decode(format!("empty tagged {}", def.name)));
                }
                tag = Some(payload[0]);
                payload[0] = 0;
            } else {
                if payload.is_empty() {
                    return Err(IgorError::Decode(format!("empty tagged {}", def.name)));
                }
                tag = Some(payload.remove(0));
            }
        }

        if def.encrypted {
            payload = cipher::decrypt(&payload, authenticator, secret, None)?;
        } else if def.salted {
            payload = cipher::decrypt_salted(&payload, authenticator, secret, def.withlen)?;
        }

        let value = decode_value(&payload, &def)?;
        Ok((Self { def, tag, value }, length))
    }
}

fn encode_value(value: &RadiusValue) -> Vec<u8> {
    match value {
        RadiusValue::Octets(v) => v.clone(),
        RadiusValue::String(s) => s.as_bytes().to_vec(),
        RadiusValue::Integer(v) => v.to_be_bytes().to_vec(),
        RadiusValue::Integer64(v) => v.to_be_bytes().to_vec(),
        RadiusValue::Address(a) => a.octets().to_vec(),
        RadiusValue::Time(v) => v.to_be_bytes().to_vec(),
        RadiusValue::IPv6Address(a) => a.octets().to_vec(),
        RadiusValue::IPv6Prefix { prefix_len, prefix } => {
            let mut data = vec![0, *prefix_len];
            data.extend_from_slice(&prefix.octets());
            data
        }
        RadiusValue::InterfaceId(v) => v.to_vec(),
    }
}

fn decode_value(data: &[u8], def: &RadiusAvpDef) -> Result<RadiusValue> {
    let value = match def.radius_type {
        RadiusType::Octets | RadiusType::Vsa => RadiusValue::Octets(data.to_vec()),

        RadiusType::String => {
            let text = String::from_utf8(data.to_vec())
                .map_err(|_| IgorError::Decode(format!("invalid UTF-8 in {}", def.name)))?;
            // Ciphers pad with zeros; the padding is not part of the value
            if def.encrypted || def.salted {
                RadiusValue::String(text.trim_end_matches('\0').to_string())
            } else {
                RadiusValue::String(text)
            }
        }

        RadiusType::Integer => {
            let bytes: [u8; 4] = data.try_into().map_err(|_| {
                IgorError::Decode(format!("bad length {} for {}", data.len(), def.name))
            })?;
            RadiusValue::Integer(u32::from_be_bytes(bytes))
        }

        RadiusType::Integer64 => {
            let bytes: [u8; 8] = data.try_into().map_err(|_| {
                IgorError::Decode(format!("bad length {} for {}", data.len(), def.name))
            })?;
            RadiusValue::Integer64(u64::from_be_bytes(bytes))
        }

        RadiusType::Address => {
            let bytes: [u8; 4] = data.try_into().map_err(|_| {
                IgorError::Decode(format!("bad length {} for {}", data.len(), def.name))
            })?;
            RadiusValue::Address(Ipv4Addr::from(bytes))
        }

        RadiusType::Time => {
            let bytes: [u8; 4] = data.try_into().map_err(|_| {
                IgorError::Decode(format!("bad length {} for {}", data.len(), def.name))
            })?;
            RadiusValue::Time(u32::from_be_bytes(bytes))
        }

        RadiusType::IPv6Address => {
            let bytes: [u8; 16] = data.try_into().map_err(|_| {
                IgorError::Decode(format!("bad length {} for {}", data.len(), def.name))
            })?;
            RadiusValue::IPv6Address(Ipv6Addr::from(bytes))
        }

        RadiusType::IPv6Prefix => {
            if data.len() < 2 || data.len() > 18 {
                return Err(IgorError::Decode(format!(
                    "bad length {} for {}",
                    data.len(),
                    def.name
                )));
            }
            let mut octets = [0u8; 16];
            octets[..data.len() - 2].copy_from_slice(&data[2..]);
            RadiusValue::IPv6Prefix {
                prefix_len: data[1],
                prefix: Ipv6Addr::from(octets),
            }
        }

        RadiusType::InterfaceId => {
            let bytes: [u8; 8] = data.try_into().map_err(|_| {
                IgorError::Decode(format!("bad length {} for {}", data.len(), def.name))
            })?;
            RadiusValue::InterfaceId(bytes)
        }
    };

    Ok(value)
}

// Coerce a caller supplied value into the dictionary declared type
fn coerce(value: RadiusValue, def: &RadiusAvpDef) -> Result<RadiusValue> {
    use RadiusType as T;

    let mismatch = |value: &RadiusValue| {
        IgorError::Internal(format!(
            "value {:?} not compatible with {} type {:?}",
            value, def.name, def.radius_type
        ))
    };

    let value = match (def.radius_type, value) {
        (T::Octets | T::Vsa, RadiusValue::Octets(v)) => RadiusValue::Octets(v),
        (T::Octets | T::Vsa, RadiusValue::String(s)) => RadiusValue::Octets(from_hex(&s)?),

        (T::String, RadiusValue::String(s)) => RadiusValue::String(s),

        (T::Integer, RadiusValue::Integer(v)) => RadiusValue::Integer(v),
        (T::Integer, RadiusValue::Integer64(v)) => RadiusValue::Integer(v as u32),
        (T::Integer, RadiusValue::String(s)) => {
            // Either an enumerated name or a numeric literal
            if let Some(code) = def.enum_values.get(&s) {
                RadiusValue::Integer(*code)
            } else {
                RadiusValue::Integer(s.parse().map_err(|_| {
                    IgorError::Internal(format!("{s} is not a value of {}", def.name))
                })?)
            }
        }

        (T::Integer64, RadiusValue::Integer64(v)) => RadiusValue::Integer64(v),
        (T::Integer64, RadiusValue::Integer(v)) => RadiusValue::Integer64(v as u64),

        (T::Address, RadiusValue::Address(a)) => RadiusValue::Address(a),
        (T::Address, RadiusValue::String(s)) => RadiusValue::Address(
            s.parse()
                .map_err(|_| IgorError::Internal(format!("bad IP address {s} for {}", def.name)))?,
        ),

        (T::Time, RadiusValue::Time(v)) => RadiusValue::Time(v),
        (T::Time, RadiusValue::Integer(v)) => RadiusValue::Time(v),

        (T::IPv6Address, RadiusValue::IPv6Address(a)) => RadiusValue::IPv6Address(a),
        (T::IPv6Address, RadiusValue::String(s)) => RadiusValue::IPv6Address(
            s.parse()
                .map_err(|_| IgorError::Internal(format!("bad IPv6 address {s} for {}", def.name)))?,
        ),

        (T::IPv6Prefix, prefix @ RadiusValue::IPv6Prefix { .. }) => prefix,
        (T::IPv6Prefix, RadiusValue::String(s)) => {
            let (addr, len) = s.split_once('/').ok_or_else(|| {
                IgorError::Internal(format!("bad IPv6 prefix {s} for {}", def.name))
            })?;
            RadiusValue::IPv6Prefix {
                prefix_len: len.parse().map_err(|_| {
                    IgorError::Internal(format!("bad IPv6 prefix {s} for {}", def.name))
                })?,
                prefix: addr.parse().map_err(|_| {
                    IgorError::Internal(format!("bad IPv6 prefix {s} for {}", def.name))
                })?,
            }
        }

        (T::InterfaceId, RadiusValue::InterfaceId(v)) => RadiusValue::InterfaceId(v),
        (T::InterfaceId, RadiusValue::Octets(v)) => {
            let bytes: [u8; 8] = v
                .as_slice()
                .try_into()
                .map_err(|_| IgorError::Internal(format!("bad interface id for {}", def.name)))?;
            RadiusValue::InterfaceId(bytes)
        }
        (T::InterfaceId, RadiusValue::String(s)) => {
            let v = from_hex(&s)?;
            let bytes: [u8; 8] = v
                .as_slice()
                .try_into()
                .map_err(|_| IgorError::Internal(format!("bad interface id for {}", def.name)))?;
            RadiusValue::InterfaceId(bytes)
        }

        (_, v) => return Err(mismatch(&v)),
    };

    Ok(value)
}

fn to_hex(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for byte in data {
        s.push_str(&format!("{byte:02x}"));
    }
    s
}

fn from_hex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(IgorError::Internal(format!("odd length hex string {s}")));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| IgorError::Internal(format!("bad hex string {s}")))
        })
        .collect()
}

impl fmt::Display for RadiusAvp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            RadiusValue::Octets(v) => write!(f, "{}", to_hex(v)),
            RadiusValue::String(s) => write!(f, "{s}"),
            RadiusValue::Integer(v) => match self.def.enum_names.get(v) {
                Some(name) => write!(f, "{name}"),
                None => write!(f, "{v}"),
            },
            RadiusValue::Integer64(v) => write!(f, "{v}"),
            RadiusValue::Address(a) => write!(f, "{a}"),
            RadiusValue::Time(v) => write!(f, "{v}"),
            RadiusValue::IPv6Address(a) => write!(f, "{a}"),
            RadiusValue::IPv6Prefix { prefix_len, prefix } => write!(f, "{prefix}/{prefix_len}"),
            RadiusValue::InterfaceId(v) => write!(f, "{}", to_hex(v)),
        }
    }
}
