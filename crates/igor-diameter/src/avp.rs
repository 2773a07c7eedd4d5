use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use igor_dict::{DiameterAvpDef, DiameterDictionary, DiameterType};

use igor_core::{IgorError, Result};

// AVP flags
pub const AVP_FLAG_VENDOR: u8 = 0x80;
pub const AVP_FLAG_MANDATORY: u8 = 0x40;
pub const AVP_FLAG_PROTECTED: u8 = 0x20;

/// Decoded AVP value, one variant per dictionary data type family
#[derive(Debug, Clone, PartialEq)]
pub enum AvpValue {
    Octets(Vec<u8>),
    Utf8(String),
    Int32(i32),
    Int64(i64),
    Uint32(u32),
    Uint64(u64),
    Float32(f32),
    Float64(f64),
    Address(IpAddr),
    /// Seconds since 1900-01-01 UTC
    Time(u32),
    Ipv6Prefix { prefix_len: u8, prefix: Ipv6Addr },
    Enumerated(i32),
    Grouped(Vec<DiameterAvp>),
}

impl From<&str> for AvpValue {
    fn from(v: &str) -> Self {
        Self::Utf8(v.to_string())
    }
}

impl From<String> for AvpValue {
    fn from(v: String) -> Self {
        Self::Utf8(v)
    }
}

impl From<Vec<u8>> for AvpValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Octets(v)
    }
}

impl From<&[u8]> for AvpValue {
    fn from(v: &[u8]) -> Self {
        Self::Octets(v.to_vec())
    }
}

impl From<i32> for AvpValue {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for AvpValue {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<u32> for AvpValue {
    fn from(v: u32) -> Self {
        Self::Uint32(v)
    }
}

impl From<u64> for AvpValue {
    fn from(v: u64) -> Self {
        Self::Uint64(v)
    }
}

impl From<f32> for AvpValue {
    fn from(v: f32) -> Self {
        Self::Float32(v)
    }
}

impl From<f64> for AvpValue {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<IpAddr> for AvpValue {
    fn from(v: IpAddr) -> Self {
        Self::Address(v)
    }
}

impl From<Vec<DiameterAvp>> for AvpValue {
    fn from(v: Vec<DiameterAvp>) -> Self {
        Self::Grouped(v)
    }
}

/// One Diameter AVP: its dictionary entry, wire flags and typed value
#[derive(Debug, Clone)]
pub struct DiameterAvp {
    pub def: Arc<DiameterAvpDef>,
    pub flags: u8,
    pub value: AvpValue,
}

impl PartialEq for DiameterAvp {
    fn eq(&self, other: &Self) -> bool {
        self.def.code == other.def.code
            && self.def.vendor_id == other.def.vendor_id
            && self.flags == other.flags
            && self.value == other.value
    }
}

impl DiameterAvp {
    /// Create an AVP by dictionary name, coercing the value to the
    /// declared data type
    pub fn new(name: &str, value: impl Into<AvpValue>, dict: &DiameterDictionary) -> Result<Self> {
        let def = dict.avp_by_name(name)?;
        let value = coerce(value.into(), &def)?;
        let mut flags = AVP_FLAG_MANDATORY;
        if def.vendor_id != 0 {
            flags |= AVP_FLAG_VENDOR;
        }
        Ok(Self { def, flags, value })
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn code(&self) -> u32 {
        self.def.code
    }

    pub fn vendor_id(&self) -> u32 {
        self.def.vendor_id
    }

    /// Push a child AVP. Only valid on Grouped AVPs.
    pub fn add_avp(&mut self, avp: DiameterAvp) -> Result<&mut Self> {
        match &mut self.value {
            AvpValue::Grouped(children) => {
                children.push(avp);
                Ok(self)
            }
            _ => Err(IgorError::Internal(format!(
                "cannot add child AVP to non grouped {}",
                self.def.name
            ))),
        }
    }

    /// First child with the given name. Only meaningful on Grouped AVPs.
    pub fn get(&self, name: &str) -> Option<&DiameterAvp> {
        match &self.value {
            AvpValue::Grouped(children) => children.iter().find(|a| a.name() == name),
            _ => None,
        }
    }

    /// All children with the given name
    pub fn get_all(&self, name: &str) -> Vec<&DiameterAvp> {
        match &self.value {
            AvpValue::Grouped(children) => {
                children.iter().filter(|a| a.name() == name).collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn as_str(&self) -> String {
        self.to_string()
    }

    pub fn as_int(&self) -> Option<i64> {
        match &self.value {
            AvpValue::Int32(v) => Some(*v as i64),
            AvpValue::Int64(v) => Some(*v),
            AvpValue::Uint32(v) => Some(*v as i64),
            AvpValue::Uint64(v) => Some(*v as i64),
            AvpValue::Enumerated(v) => Some(*v as i64),
            AvpValue::Time(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_octets(&self) -> Option<&[u8]> {
        match &self.value {
            AvpValue::Octets(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_address(&self) -> Option<IpAddr> {
        match &self.value {
            AvpValue::Address(v) => Some(*v),
            _ => None,
        }
    }

    /// Validate a Grouped AVP against its group schema, recursively.
    /// Errors name the offending attribute.
    pub fn check(&self) -> Result<()> {
        let children = match &self.value {
            AvpValue::Grouped(children) => children,
            _ => return Ok(()),
        };

        for (child_name, occurs) in &self.def.group {
            let count = children.iter().filter(|a| a.name() == child_name).count() as u32;
            if count < occurs.min_occurs {
                return Err(IgorError::Schema(format!(
                    "{} in {} appears {} times, minimum is {}",
                    child_name, self.def.name, count, occurs.min_occurs
                )));
            }
            if count > occurs.max_occurs {
                return Err(IgorError::Schema(format!(
                    "{} in {} appears {} times, maximum is {}",
                    child_name, self.def.name, count, occurs.max_occurs
                )));
            }
        }

        for child in children {
            if !self.def.group.contains_key(child.name()) {
                return Err(IgorError::Schema(format!(
                    "{} not allowed in {}",
                    child.name(),
                    self.def.name
                )));
            }
            child.check()?;
        }

        Ok(())
    }

    /// Serialize to wire format, padded to a 4 byte boundary
    pub fn to_bytes(&self) -> Vec<u8> {
        let data = encode_value(&self.value, self.def.data_type);

        let mut bytes = Vec::with_capacity(12 + data.len());
        bytes.extend_from_slice(&self.def.code.to_be_bytes());

        // Length counts header, optional vendor id and value, not padding
        let header_len = if self.def.vendor_id != 0 { 12 } else { 8 };
        let length = (header_len + data.len()) as u32;
        bytes.push(self.flags);
        bytes.extend_from_slice(&length.to_be_bytes()[1..4]);

        if self.def.vendor_id != 0 {
            bytes.extend_from_slice(&self.def.vendor_id.to_be_bytes());
        }
        bytes.extend_from_slice(&data);

        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        bytes
    }

    /// Parse one AVP. Returns the AVP and the number of bytes consumed
    /// including padding.
    pub fn from_bytes(data: &[u8], dict: &DiameterDictionary) -> Result<(Self, usize)> {
        if data.len() < 8 {
            return Err(IgorError::Decode("AVP header too short".to_string()));
        }

        let code = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let flags = data[4];
        let length = u32::from_be_bytes([0, data[5], data[6], data[7]]) as usize;

        let header_len = if flags & AVP_FLAG_VENDOR != 0 { 12 } else { 8 };
        if length < header_len || data.len() < length {
            return Err(IgorError::Decode(format!(
                "invalid AVP length {length} for code {code}"
            )));
        }

        let vendor_id = if flags & AVP_FLAG_VENDOR != 0 {
            u32::from_be_bytes([data[8], data[9], data[10], data[11]])
        } else {
            0
        };

        let def = dict.avp_by_code(vendor_id, code);
        let value = decode_value(&data[header_len..length], &def, dict)?;

        // Padding is carried on the wire but not counted in the length
        let consumed = length.div_ceil(4) * 4;
        Ok((Self { def, flags, value }, consumed))
    }
}

fn encode_value(value: &AvpValue, data_type: DiameterType) -> Vec<u8> {
    match value {
        AvpValue::Octets(v) => v.clone(),
        AvpValue::Utf8(v) => v.as_bytes().to_vec(),
        AvpValue::Int32(v) => v.to_be_bytes().to_vec(),
        AvpValue::Int64(v) => v.to_be_bytes().to_vec(),
        AvpValue::Uint32(v) => v.to_be_bytes().to_vec(),
        AvpValue::Uint64(v) => v.to_be_bytes().to_vec(),
        AvpValue::Float32(v) => v.to_be_bytes().to_vec(),
        AvpValue::Float64(v) => v.to_be_bytes().to_vec(),
        AvpValue::Enumerated(v) => v.to_be_bytes().to_vec(),
        AvpValue::Time(v) => v.to_be_bytes().to_vec(),
        AvpValue::Address(addr) => match (data_type, addr) {
            // The Address type carries a two byte family prefix; the
            // IPv4Address and IPv6Address types carry raw address bytes
            (DiameterType::Address, IpAddr::V4(v4)) => {
                let mut data = vec![0, 1];
                data.extend_from_slice(&v4.octets());
                data
            }
            (DiameterType::Address, IpAddr::V6(v6)) => {
                let mut data = vec![0, 2];
                data.extend_from_slice(&v6.octets());
                data
            }
            (_, IpAddr::V4(v4)) => v4.octets().to_vec(),
            (_, IpAddr::V6(v6)) => v6.octets().to_vec(),
        },
        AvpValue::Ipv6Prefix { prefix_len, prefix } => {
            let mut data = vec![0, *prefix_len];
            data.extend_from_slice(&prefix.octets());
            data
        }
        AvpValue::Grouped(children) => {
            let mut data = Vec::new();
            for child in children {
                data.extend_from_slice(&child.to_bytes());
            }
            data
        }
    }
}

fn decode_value(
    data: &[u8],
    def: &DiameterAvpDef,
    dict: &DiameterDictionary,
) -> Result<AvpValue> {
    let fixed = |expected: usize| -> Result<&[u8]> {
        if data.len() != expected {
            return Err(IgorError::Decode(format!(
                "bad length {} for {}, expected {}",
                data.len(),
                def.name,
                expected
            )));
        }
        Ok(data)
    };

    let value = match def.data_type {
        DiameterType::OctetString => AvpValue::Octets(data.to_vec()),

        DiameterType::UTF8String
        | DiameterType::DiameterIdentity
        | DiameterType::DiameterURI
        | DiameterType::IPFilterRule => AvpValue::Utf8(
            String::from_utf8(data.to_vec())
                .map_err(|_| IgorError::Decode(format!("invalid UTF-8 in {}", def.name)))?,
        ),

        DiameterType::Integer32 => {
            AvpValue::Int32(i32::from_be_bytes(fixed(4)?.try_into().unwrap()))
        }
        DiameterType::Integer64 => {
            AvpValue::Int64(i64::from_be_bytes(fixed(8)?.try_into().unwrap()))
        }
        DiameterType::Unsigned32 => {
            AvpValue::Uint32(u32::from_be_bytes(fixed(4)?.try_into().unwrap()))
        }
        DiameterType::Unsigned64 => {
            AvpValue::Uint64(u64::from_be_bytes(fixed(8)?.try_into().unwrap()))
        }
        DiameterType::Float32 => {
            AvpValue::Float32(f32::from_be_bytes(fixed(4)?.try_into().unwrap()))
        }
        DiameterType::Float64 => {
            AvpValue::Float64(f64::from_be_bytes(fixed(8)?.try_into().unwrap()))
        }
        DiameterType::Enumerated => {
            AvpValue::Enumerated(i32::from_be_bytes(fixed(4)?.try_into().unwrap()))
        }
        DiameterType::Time => AvpValue::Time(u32::from_be_bytes(fixed(4)?.try_into().unwrap())),

        DiameterType::Address => {
            if data.len() < 2 {
                return Err(IgorError::Decode(format!("short address in {}", def.name)));
            }
            let family = u16::from_be_bytes([data[0], data[1]]);
            let addr = &data[2..];
            match family {
                1 => {
                    let octets: [u8; 4] = addr.try_into().map_err(|_| {
                        IgorError::Decode(format!("bad IPv4 address in {}", def.name))
                    })?;
                    AvpValue::Address(IpAddr::V4(Ipv4Addr::from(octets)))
                }
                2 => {
                    let octets: [u8; 16] = addr.try_into().map_err(|_| {
                        IgorError::Decode(format!("bad IPv6 address in {}", def.name))
                    })?;
                    AvpValue::Address(IpAddr::V6(Ipv6Addr::from(octets)))
                }
                _ => {
                    return Err(IgorError::Decode(format!(
                        "unknown address family {} in {}",
                        family, def.name
                    )))
                }
            }
        }

        DiameterType::IPv4Address => {
            let octets: [u8; 4] = fixed(4)?.try_into().unwrap();
            AvpValue::Address(IpAddr::V4(Ipv4Addr::from(octets)))
        }

        DiameterType::IPv6Address => {
            let octets: [u8; 16] = fixed(16)?.try_into().unwrap();
            AvpValue::Address(IpAddr::V6(Ipv6Addr::from(octets)))
        }

        DiameterType::IPv6Prefix => {
            let data = fixed(18)?;
            let octets: [u8; 16] = data[2..].try_into().unwrap();
            AvpValue::Ipv6Prefix {
                prefix_len: data[1],
                prefix: Ipv6Addr::from(octets),
            }
        }

        DiameterType::Grouped => {
            let mut children = Vec::new();
            let mut offset = 0;
            while offset < data.len() {
                let (child, consumed) = DiameterAvp::from_bytes(&data[offset..], dict)?;
                children.push(child);
                offset += consumed;
            }
            AvpValue::Grouped(children)
        }
    };

    Ok(value)
}

// Coerce a caller supplied value into the dictionary declared type.
// String inputs are parsed for the address, prefix, enumerated and octets
// (hex) types; integer inputs are widened or narrowed between the four
// integer types.
fn coerce(value: AvpValue, def: &DiameterAvpDef) -> Result<AvpValue> {
    use DiameterType as T;

    let mismatch = |value: &AvpValue| {
        IgorError::Internal(format!(
            "value {:?} not compatible with {} type {:?}",
            value, def.name, def.data_type
        ))
    };

    let value = match (def.data_type, value) {
        (T::OctetString, AvpValue::Octets(v)) => AvpValue::Octets(v),
        (T::OctetString, AvpValue::Utf8(s)) => AvpValue::Octets(from_hex(&s)?),

        (
            T::UTF8String | T::DiameterIdentity | T::DiameterURI | T::IPFilterRule,
            AvpValue::Utf8(s),
        ) => AvpValue::Utf8(s),

        (T::Integer32, v) => AvpValue::Int32(int_of(&v).ok_or_else(|| mismatch(&v))? as i32),
        (T::Integer64, v) => AvpValue::Int64(int_of(&v).ok_or_else(|| mismatch(&v))?),
        (T::Unsigned32, v) => AvpValue::Uint32(int_of(&v).ok_or_else(|| mismatch(&v))? as u32),
        (T::Unsigned64, v) => AvpValue::Uint64(int_of(&v).ok_or_else(|| mismatch(&v))? as u64),

        (T::Float32, AvpValue::Float32(v)) => AvpValue::Float32(v),
        (T::Float32, AvpValue::Float64(v)) => AvpValue::Float32(v as f32),
        (T::Float64, AvpValue::Float64(v)) => AvpValue::Float64(v),
        (T::Float64, AvpValue::Float32(v)) => AvpValue::Float64(v as f64),

        (T::Address | T::IPv4Address | T::IPv6Address, AvpValue::Address(a)) => {
            AvpValue::Address(a)
        }
        (T::Address | T::IPv4Address | T::IPv6Address, AvpValue::Utf8(s)) => {
            let addr: IpAddr = s
                .parse()
                .map_err(|_| IgorError::Internal(format!("bad IP address {s} for {}", def.name)))?;
            AvpValue::Address(addr)
        }

        (T::Time, AvpValue::Time(v)) => AvpValue::Time(v),
        (T::Time, v) => AvpValue::Time(int_of(&v).ok_or_else(|| mismatch(&v))? as u32),

        (T::IPv6Prefix, prefix @ AvpValue::Ipv6Prefix { .. }) => prefix,
        (T::IPv6Prefix, AvpValue::Utf8(s)) => {
            let (addr, len) = s.split_once('/').ok_or_else(|| {
                IgorError::Internal(format!("bad IPv6 prefix {s} for {}", def.name))
            })?;
            let prefix: Ipv6Addr = addr.parse().map_err(|_| {
                IgorError::Internal(format!("bad IPv6 prefix {s} for {}", def.name))
            })?;
            let prefix_len: u8 = len.parse().map_err(|_| {
                IgorError::Internal(format!("bad IPv6 prefix {s} for {}", def.name))
            })?;
            AvpValue::Ipv6Prefix { prefix_len, prefix }
        }

        (T::Enumerated, AvpValue::Utf8(s)) => {
            let code = def.enum_values.get(&s).ok_or_else(|| {
                IgorError::Internal(format!("{s} is not a value of {}", def.name))
            })?;
            AvpValue::Enumerated(*code)
        }
        (T::Enumerated, v) => {
            AvpValue::Enumerated(int_of(&v).ok_or_else(|| mismatch(&v))? as i32)
        }

        (T::Grouped, AvpValue::Grouped(children)) => AvpValue::Grouped(children),

        (_, v) => return Err(mismatch(&v)),
    };

    Ok(value)
}

fn int_of(value: &AvpValue) -> Option<i64> {
    match value {
        AvpValue::Int32(v) => Some(*v as i64),
        AvpValue::Int64(v) => Some(*v),
        AvpValue::Uint32(v) => Some(*v as i64),
        AvpValue::Uint64(v) => Some(*v as i64),
        AvpValue::Enumerated(v) => Some(*v as i64),
        AvpValue::Time(v) => Some(*v as i64),
        _ => None,
    }
}

pub(crate) fn to_hex(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for byte in data {
        s.push_str(&format!("{byte:02x}"));
    }
    s
}

pub(crate) fn from_hex(s: &str) -> Result<Vec<u8>> {
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

impl fmt::Display for DiameterAvp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            AvpValue::Octets(v) => write!(f, "{}", to_hex(v)),
            AvpValue::Utf8(v) => write!(f, "{v}"),
            AvpValue::Int32(v) => write!(f, "{v}"),
            AvpValue::Int64(v) => write!(f, "{v}"),
            AvpValue::Uint32(v) => write!(f, "{v}"),
            AvpValue::Uint64(v) => write!(f, "{v}"),
            AvpValue::Float32(v) => write!(f, "{v}"),
            AvpValue::Float64(v) => write!(f, "{v}"),
            AvpValue::Address(v) => write!(f, "{v}"),
            AvpValue::Time(v) => write!(f, "{v}"),
            AvpValue::Ipv6Prefix { prefix_len, prefix } => write!(f, "{prefix}/{prefix_len}"),
            AvpValue::Enumerated(v) => match self.def.enum_names.get(v) {
                Some(name) => write!(f, "{name}"),
                None => write!(f, "{v}"),
            },
            AvpValue::Grouped(children) => {
                write!(f, "{{")?;
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}={}", child.name(), child)?;
                }
                write!(f, "}}")
            }
        }
    }
}
