use std::fmt;

use igor_core::constants::{
    ACCESS_ACCEPT, ACCESS_REJECT, ACCESS_REQUEST, ACCOUNTING_REQUEST, COA_NAK, COA_REQUEST,
    DISCONNECT_NAK, DISCONNECT_REQUEST, RADIUS_MESSAGE_AUTHENTICATOR, VENDOR_CISCO,
};
use igor_core::{IgorError, Result};
use igor_dict::RadiusDictionary;

use crate::avp::{RadiusAvp, RadiusValue};
use crate::cipher;

const HEADER_SIZE: usize = 20;

/// One RADIUS packet: code, identifier, authenticator and the ordered
/// attribute list
#[derive(Debug, Clone, PartialEq)]
pub struct RadiusPacket {
    pub code: u8,
    pub identifier: u8,
    pub authenticator: [u8; 16],
    pub avps: Vec<RadiusAvp>,
}

impl RadiusPacket {
    /// Create a request with a fresh random authenticator
    pub fn new_request(code: u8) -> Self {
        Self {
            code,
            identifier: 0,
            avps: Vec::new(),
            authenticator: cipher::random_authenticator(),
        }
    }

    /// Create the response for a request. The packet keeps the request
    /// authenticator: serialization keys the ciphers with it and derives
    /// the response authenticator from it.
    pub fn new_response(request: &Self, success: bool) -> Self {
        let code = match request.code {
            ACCESS_REQUEST => {
                if success {
                    ACCESS_ACCEPT
                } else {
                    ACCESS_REJECT
                }
            }
            DISCONNECT_REQUEST if !success => DISCONNECT_NAK,
            COA_REQUEST if !success => COA_NAK,
            other => other + 1,
        };
        Self {
            code,
            identifier: request.identifier,
            authenticator: request.authenticator,
            avps: Vec::new(),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self.code,
            ACCESS_REQUEST | ACCOUNTING_REQUEST | DISCONNECT_REQUEST | COA_REQUEST
        )
    }

    /// Add an attribute built by name
    pub fn add(
        &mut self,
        name: &str,
        value: impl Into<RadiusValue>,
        dict: &RadiusDictionary,
    ) -> Result<&mut Self> {
        let avp = RadiusAvp::new(name, value, dict)?;
        self.avps.push(avp);
        Ok(self)
    }

    pub fn add_avp(&mut self, avp: RadiusAvp) -> &mut Self {
        self.avps.push(avp);
        self
    }

    pub fn get_avp(&self, name: &str) -> Option<&RadiusAvp> {
        self.avps.iter().find(|a| a.name() == name)
    }

    pub fn get_all_avp(&self, name: &str) -> Vec<&RadiusAvp> {
        self.avps.iter().filter(|a| a.name() == name).collect()
    }

    pub fn delete_all_avp(&mut self, name: &str) -> &mut Self {
        self.avps.retain(|a| a.name() != name);
        self
    }

    /// String rendering of an attribute, empty if not present
    pub fn get_str_avp(&self, name: &str) -> String {
        self.get_avp(name).map(|a| a.to_string()).unwrap_or_default()
    }

    pub fn get_int_avp(&self, name: &str) -> Option<i64> {
        self.get_avp(name).and_then(|a| a.as_int())
    }

    pub fn get_password_str_avp(&self, name: &str) -> String {
        self.get_avp(name)
            .and_then(|a| a.as_password_string().ok())
            .unwrap_or_default()
    }

    /// Lookup of `key=value` pairs carried in Cisco-AVPair attributes
    pub fn get_cisco_avpair(&self, key: &str) -> Option<String> {
        self.avps
            .iter()
            .filter(|a| a.vendor_id() == VENDOR_CISCO && a.name() == "Cisco-AVPair")
            .filter_map(|a| match &a.value {
                RadiusValue::String(s) => s.split_once('='),
                _ => None,
            })
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.to_string())
    }

    /// Copy the packet restricting the attribute list. A non empty
    /// positive set keeps only those names; otherwise the negative set is
    /// removed. Order is preserved.
    pub fn copy(&self, positive: &[&str], negative: &[&str]) -> Self {
        let mut copied = self.clone();
        if !positive.is_empty() {
            copied.avps.retain(|a| positive.contains(&a.name()));
        } else {
            copied.avps.retain(|a| !negative.contains(&a.name()));
        }
        copied
    }

    // The authenticator value present in the packet bytes while ciphers
    // run and Message-Authenticator is computed: the random one for
    // Access-Request, zero for other requests, the request authenticator
    // for responses.
    fn cipher_authenticator(&self) -> [u8; 16] {
        match self.code {
            ACCESS_REQUEST => self.authenticator,
            ACCOUNTING_REQUEST | DISCONNECT_REQUEST | COA_REQUEST => [0u8; 16],
            _ => self.authenticator,
        }
    }

    /// Serialize the packet. Message-Authenticator is stamped after all
    /// other attributes; for codes other than Access-Request the
    /// authenticator field is replaced by MD5(packet ∥ secret) last.
    pub fn to_bytes(&self, secret: &str) -> Result<Vec<u8>> {
        let cipher_auth = self.cipher_authenticator();

        let mut attr_bytes = Vec::new();
        let mut message_auth_offset = None;
        for avp in &self.avps {
            if avp.vendor_id() == 0 && avp.code() == RADIUS_MESSAGE_AUTHENTICATOR {
                // Zeroed during computation, patched below
                message_auth_offset = Some(HEADER_SIZE + attr_bytes.len() + 2);
                attr_bytes.push(RADIUS_MESSAGE_AUTHENTICATOR);
                attr_bytes.push(18);
                attr_bytes.extend_from_slice(&[0u8; 16]);
            } else {
                attr_bytes.extend_from_slice(&avp.to_bytes(&cipher_auth, secret)?);
            }
        }

        let length = HEADER_SIZE + attr_bytes.len();
        if length > igor_core::constants::RADIUS_MAX_PACKET_SIZE {
            return Err(IgorError::Internal(format!("packet too long: {length}")));
        }

        let mut bytes = Vec::with_capacity(length);
        bytes.push(self.code);
        bytes.push(self.identifier);
        bytes.extend_from_slice(&(length as u16).to_be_bytes());
        bytes.extend_from_slice(&cipher_auth);
        bytes.extend_from_slice(&attr_bytes);

        if let Some(offset) = message_auth_offset {
            let mac = cipher::message_authenticator(&bytes, secret);
            bytes[offset..offset + 16].copy_from_slice(&mac);
        }

        if self.code != ACCESS_REQUEST {
            let authenticator = cipher::packet_authenticator(&bytes, secret);
            bytes[4..HEADER_SIZE].copy_from_slice(&authenticator);
        }

        Ok(bytes)
    }

    /// Parse a packet. `request_authenticator` is required to decode a
    /// response (it keys the ciphers); requests key them from their own
    /// header per code.
    pub fn from_bytes(
        data: &[u8],
        secret: &str,
        request_authenticator: Option<&[u8; 16]>,
        dict: &RadiusDictionary,
    ) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(IgorError::Decode("packet header too short".to_string()));
        }

        let code = data[0];
        let identifier = data[1];
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        if length < HEADER_SIZE || data.len() < length {
            return Err(IgorError::Decode(format!("invalid packet length {length}")));
        }
        let authenticator: [u8; 16] = data[4..HEADER_SIZE].try_into().unwrap();

        let cipher_auth = match code {
            ACCESS_REQUEST => authenticator,
            ACCOUNTING_REQUEST | DISCONNECT_REQUEST | COA_REQUEST => [0u8; 16],
            _ => *request_authenticator.ok_or_else(|| {
                IgorError::Auth("response decode requires the request authenticator".to_string())
            })?,
        };

        let mut avps = Vec::new();
        let mut offset = HEADER_SIZE;
        while offset < length {
            let (avp, consumed) =
                RadiusAvp::from_bytes(&data[offset..length], &cipher_auth, secret, dict)?;
            avps.push(avp);
            offset += consumed;
        }

        Ok(Self {
            code,
            identifier,
            authenticator,
            avps,
        })
    }
}

/// Recompute the authenticator of a serialized request packet (codes other
/// than Access-Request) and compare
pub fn validate_request_authenticator(packet_bytes: &[u8], secret: &str) -> bool {
    if packet_bytes.len() < HEADER_SIZE {
        return false;
    }
    let mut zeroed = packet_bytes.to_vec();
    zeroed[4..HEADER_SIZE].fill(0);
    cipher::packet_authenticator(&zeroed, secret) == packet_bytes[4..HEADER_SIZE]
}

/// Recompute the authenticator of a serialized response against the
/// originating request authenticator and compare
pub fn validate_response_authenticator(
    packet_bytes: &[u8],
    request_authenticator: &[u8; 16],
    secret: &str,
) -> bool {
    if packet_bytes.len() < HEADER_SIZE {
        return false;
    }
    let mut swapped = packet_bytes.to_vec();
    swapped[4..HEADER_SIZE].copy_from_slice(request_authenticator);
    cipher::packet_authenticator(&swapped, secret) == packet_bytes[4..HEADER_SIZE]
}

/// Validate the Message-Authenticator attribute of a serialized packet,
/// if present. Packets without the attribute validate trivially.
pub fn validate_message_authenticator(packet_bytes: &[u8], secret: &str) -> bool {
    if packet_bytes.len() < HEADER_SIZE {
        return false;
    }

    // Locate the attribute in the serialized form
    let mut offset = HEADER_SIZE;
    while offset + 2 <= packet_bytes.len() {
        let attr_type = packet_bytes[offset];
        let attr_len = packet_bytes[offset + 1] as usize;
        if attr_len < 2 || offset + attr_len > packet_bytes.len() {
            return false;
        }
        if attr_type == RADIUS_MESSAGE_AUTHENTICATOR && attr_len == 18 {
            let claimed = &packet_bytes[offset + 2..offset + 18];
            let mut zeroed = packet_bytes.to_vec();
            zeroed[offset + 2..offset + 18].fill(0);
            return cipher::message_authenticator(&zeroed, secret) == claimed;
        }
        offset += attr_len;
    }

    true
}

impl fmt::Display for RadiusPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code={} id={} {{", self.code, self.identifier)?;
        for (i, avp) in self.avps.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}={}", avp.name(), avp)?;
        }
        write!(f, "}}")
    }
}
