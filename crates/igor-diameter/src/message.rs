use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt};

use igor_core::constants::{AVP_ORIGIN_HOST, AVP_ORIGIN_REALM, AVP_RESULT_CODE};
use igor_core::{IgorError, Result};
use igor_dict::DiameterDictionary;

use crate::avp::{AvpValue, DiameterAvp};

// Header flags
pub const FLAG_REQUEST: u8 = 0x80;
pub const FLAG_PROXYABLE: u8 = 0x40;
pub const FLAG_ERROR: u8 = 0x20;
pub const FLAG_RETRANSMISSION: u8 = 0x10;

const HEADER_SIZE: usize = 20;

/// One Diameter message: header fields plus the ordered AVP list
#[derive(Debug, Clone, PartialEq)]
pub struct DiameterMessage {
    pub version: u8,
    pub is_request: bool,
    pub is_proxyable: bool,
    pub is_error: bool,
    pub is_retransmission: bool,
    pub command_code: u32,
    pub application_id: u32,
    pub hop_by_hop_id: u32,
    pub end_to_end_id: u32,
    pub avps: Vec<DiameterAvp>,
}

impl DiameterMessage {
    /// Create a request for the named application and command, with fresh
    /// hop-by-hop and end-to-end identifiers
    pub fn new_request(
        application_name: &str,
        command_name: &str,
        dict: &DiameterDictionary,
    ) -> Result<Self> {
        let application = dict.app_by_name(application_name)?;
        let command = dict.command_by_name(command_name)?;
        Ok(Self {
            version: 1,
            is_request: true,
            is_proxyable: false,
            is_error: false,
            is_retransmission: false,
            command_code: command.code,
            application_id: application.code,
            hop_by_hop_id: rand::random(),
            end_to_end_id: rand::random(),
            avps: Vec::new(),
        })
    }

    /// Create the answer for a request, copying command code, application
    /// and both identifiers
    pub fn new_answer(request: &Self) -> Self {
        Self {
            version: 1,
            is_request: false,
            is_proxyable: request.is_proxyable,
            is_error: false,
            is_retransmission: false,
            command_code: request.command_code,
            application_id: request.application_id,
            hop_by_hop_id: request.hop_by_hop_id,
            end_to_end_id: request.end_to_end_id,
            avps: Vec::new(),
        }
    }

    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.is_request {
            flags |= FLAG_REQUEST;
        }
        if self.is_proxyable {
            flags |= FLAG_PROXYABLE;
        }
        if self.is_error {
            flags |= FLAG_ERROR;
        }
        if self.is_retransmission {
            flags |= FLAG_RETRANSMISSION;
        }
        flags
    }

    /// Serialize to wire format with the computed 24 bit length
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut avp_bytes = Vec::new();
        for avp in &self.avps {
            avp_bytes.extend_from_slice(&avp.to_bytes());
        }

        let length = (HEADER_SIZE + avp_bytes.len()) as u32;
        let mut bytes = Vec::with_capacity(length as usize);

        bytes.push(self.version);
        bytes.extend_from_slice(&length.to_be_bytes()[1..4]);
        bytes.push(self.flags());
        bytes.extend_from_slice(&self.command_code.to_be_bytes()[1..4]);
        bytes.extend_from_slice(&self.application_id.to_be_bytes());
        bytes.extend_from_slice(&self.hop_by_hop_id.to_be_bytes());
        bytes.extend_from_slice(&self.end_to_end_id.to_be_bytes());
        bytes.extend_from_slice(&avp_bytes);

        bytes
    }

    /// Parse a complete message from bytes
    pub fn from_bytes(data: &[u8], dict: &DiameterDictionary) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(IgorError::Decode("message header too short".to_string()));
        }

        let version = data[0];
        if version != 1 {
            return Err(IgorError::Decode(format!("invalid version {version}")));
        }

        let length = u32::from_be_bytes([0, data[1], data[2], data[3]]) as usize;
        if data.len() < length || length < HEADER_SIZE {
            return Err(IgorError::Decode(format!("invalid message length {length}")));
        }

        let flags = data[4];
        let command_code = u32::from_be_bytes([0, data[5], data[6], data[7]]);
        let application_id = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let hop_by_hop_id = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);
        let end_to_end_id = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);

        let mut avps = Vec::new();
        let mut offset = HEADER_SIZE;
        while offset < length {
            let (avp, consumed) = DiameterAvp::from_bytes(&data[offset..length], dict)?;
            avps.push(avp);
            offset += consumed;
        }

        Ok(Self {
            version,
            is_request: flags & FLAG_REQUEST != 0,
            is_proxyable: flags & FLAG_PROXYABLE != 0,
            is_error: flags & FLAG_ERROR != 0,
            is_retransmission: flags & FLAG_RETRANSMISSION != 0,
            command_code,
            application_id,
            hop_by_hop_id,
            end_to_end_id,
            avps,
        })
    }

    /// Read one length-prefixed message from an async stream
    pub async fn read_from<R>(reader: &mut R, dict: &DiameterDictionary) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; 4];
        reader.read_exact(&mut header).await?;

        let length = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
        if !(HEADER_SIZE..=1 << 24).contains(&length) {
            return Err(IgorError::Decode(format!("invalid message length {length}")));
        }

        let mut buffer = vec![0u8; length];
        buffer[..4].copy_from_slice(&header);
        reader.read_exact(&mut buffer[4..]).await?;

        Self::from_bytes(&buffer, dict)
    }

    /// Add an AVP built by name
    pub fn add(
        &mut self,
        name: &str,
        value: impl Into<AvpValue>,
        dict: &DiameterDictionary,
    ) -> Result<&mut Self> {
        let avp = DiameterAvp::new(name, value, dict)?;
        self.avps.push(avp);
        Ok(self)
    }

    pub fn add_avp(&mut self, avp: DiameterAvp) -> &mut Self {
        self.avps.push(avp);
        self
    }

    /// Stamp Origin-Host and Origin-Realm, replacing previous values
    pub fn add_origin_avps(
        &mut self,
        origin_host: &str,
        origin_realm: &str,
        dict: &DiameterDictionary,
    ) -> Result<&mut Self> {
        self.delete_all_avp("Origin-Host");
        self.delete_all_avp("Origin-Realm");
        self.add("Origin-Host", origin_host, dict)?;
        self.add("Origin-Realm", origin_realm, dict)?;
        Ok(self)
    }

    /// First AVP with the given name
    pub fn get_avp(&self, name: &str) -> Option<&DiameterAvp> {
        self.avps.iter().find(|a| a.name() == name)
    }

    /// All AVPs with the given name
    pub fn get_all_avp(&self, name: &str) -> Vec<&DiameterAvp> {
        self.avps.iter().filter(|a| a.name() == name).collect()
    }

    pub fn delete_all_avp(&mut self, name: &str) -> &mut Self {
        self.avps.retain(|a| a.name() != name);
        self
    }

    /// Retrieve an AVP by dotted path, descending into grouped AVPs on
    /// the first match at each level
    pub fn get_avp_from_path(&self, path: &str) -> Option<&DiameterAvp> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.get_avp(first)?;
        for segment in segments {
            current = current.get(segment)?;
        }
        Some(current)
    }

    /// String rendering of the AVP at a name or dotted path, empty if
    /// not present
    pub fn get_str_avp(&self, path: &str) -> String {
        self.get_avp_from_path(path)
            .map(|a| a.to_string())
            .unwrap_or_default()
    }

    pub fn get_int_avp(&self, path: &str) -> Option<i64> {
        self.get_avp_from_path(path).and_then(|a| a.as_int())
    }

    pub fn get_result_code(&self) -> Option<u32> {
        self.avps
            .iter()
            .find(|a| a.code() == AVP_RESULT_CODE && a.vendor_id() == 0)
            .and_then(|a| a.as_int())
            .map(|v| v as u32)
    }

    pub fn origin_host(&self) -> Option<String> {
        self.avps
            .iter()
            .find(|a| a.code() == AVP_ORIGIN_HOST && a.vendor_id() == 0)
            .map(|a| a.to_string())
    }

    pub fn origin_realm(&self) -> Option<String> {
        self.avps
            .iter()
            .find(|a| a.code() == AVP_ORIGIN_REALM && a.vendor_id() == 0)
            .map(|a| a.to_string())
    }

    pub fn destination_realm(&self) -> Option<String> {
        self.get_avp("Destination-Realm").map(|a| a.to_string())
    }

    /// Validate the message against the command schema: occurrence bounds
    /// for every declared AVP, no undeclared AVPs, grouped recursion
    pub fn check_attributes(&self, dict: &DiameterDictionary) -> Result<()> {
        let command = dict.command_by_code(self.command_code).ok_or_else(|| {
            IgorError::Schema(format!("command {} not in dictionary", self.command_code))
        })?;
        let schema = if self.is_request {
            &command.request
        } else {
            &command.answer
        };

        for (name, occurs) in schema {
            let count = self.avps.iter().filter(|a| a.name() == name).count() as u32;
            if count < occurs.min_occurs {
                return Err(IgorError::Schema(format!(
                    "{} appears {} times in {}, minimum is {}",
                    name, count, command.name, occurs.min_occurs
                )));
            }
            if count > occurs.max_occurs {
                return Err(IgorError::Schema(format!(
                    "{} appears {} times in {}, maximum is {}",
                    name, count, command.name, occurs.max_occurs
                )));
            }
        }

        for avp in &self.avps {
            if !schema.contains_key(avp.name()) {
                return Err(IgorError::Schema(format!(
                    "{} not allowed in {}",
                    avp.name(),
                    command.name
                )));
            }
            avp.check()?;
        }

        Ok(())
    }

    /// Copy the message restricting the AVP list. A non empty positive
    /// set keeps only those names; otherwise the negative set is removed.
    /// Order is preserved.
    pub fn copy(&self, positive: &[&str], negative: &[&str]) -> Self {
        let mut copied = self.clone();
        if !positive.is_empty() {
            copied.avps.retain(|a| positive.contains(&a.name()));
        } else {
            copied.avps.retain(|a| !negative.contains(&a.name()));
        }
        copied
    }
}

impl fmt::Display for DiameterMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} app={} hbh={} e2e={} {{",
            self.command_code,
            if self.is_request { "request" } else { "answer" },
            self.application_id,
            self.hop_by_hop_id,
            self.end_to_end_id
        )?;
        for (i, avp) in self.avps.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}={}", avp.name(), avp)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdict;

    fn test_request(dict: &DiameterDictionary) -> DiameterMessage {
        let mut message =
            DiameterMessage::new_request("TestApplication", "TestRequest", dict).unwrap();
        message
            .add("Session-Id", "my-session-id", dict)
            .unwrap()
            .add("Destination-Realm", "igorsuperserver", dict)
            .unwrap()
            .add("Vendor-Id", 1001u32, dict)
            .unwrap();
        message
            .add_origin_avps("server.igorserver", "igorserver", dict)
            .unwrap();
        message
    }

    #[test]
    fn test_header_roundtrip() {
        let dict = testdict::dictionary();
        let message = test_request(&dict);

        let bytes = message.to_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[4] & FLAG_REQUEST, FLAG_REQUEST);

        let rebuilt = DiameterMessage::from_bytes(&bytes, &dict).unwrap();
        assert_eq!(rebuilt, message);
        assert_eq!(rebuilt.hop_by_hop_id, message.hop_by_hop_id);
        assert_eq!(rebuilt.end_to_end_id, message.end_to_end_id);
    }

    #[test]
    fn test_byte_for_byte_roundtrip() {
        let dict = testdict::dictionary();

        let mut message = test_request(&dict);
        let mut grouped = DiameterAvp::new("Igor-myGrouped", AvpValue::Grouped(Vec::new()), &dict).unwrap();
        grouped
            .add_avp(DiameterAvp::new("Igor-myInteger32", 1i32, &dict).unwrap())
            .unwrap()
            .add_avp(DiameterAvp::new("Igor-myString", "hello", &dict).unwrap())
            .unwrap();
        message.add_avp(grouped);

        let bytes = message.to_bytes();
        let rebuilt = DiameterMessage::from_bytes(&bytes, &dict).unwrap();
        assert_eq!(rebuilt.to_bytes(), bytes);
    }

    #[test]
    fn test_answer_copies_identifiers() {
        let dict = testdict::dictionary();
        let request = test_request(&dict);

        let answer = DiameterMessage::new_answer(&request);
        assert!(!answer.is_request);
        assert_eq!(answer.command_code, request.command_code);
        assert_eq!(answer.application_id, request.application_id);
        assert_eq!(answer.hop_by_hop_id, request.hop_by_hop_id);
        assert_eq!(answer.end_to_end_id, request.end_to_end_id);
    }

    #[test]
    fn test_get_all_and_delete() {
        let dict = testdict::dictionary();

        let mut message = test_request(&dict);
        message
            .add("Igor-myUnsigned32", 8u32, &dict)
            .unwrap()
            .add("Igor-myUnsigned32", 9u32, &dict)
            .unwrap();

        let rebuilt = DiameterMessage::from_bytes(&message.to_bytes(), &dict).unwrap();
        let values: Vec<i64> = rebuilt
            .get_all_avp("Igor-myUnsigned32")
            .iter()
            .filter_map(|a| a.as_int())
            .collect();
        assert_eq!(values, vec![8, 9]);

        let mut rebuilt = rebuilt;
        rebuilt.delete_all_avp("Igor-myUnsigned32");
        assert!(rebuilt.get_all_avp("Igor-myUnsigned32").is_empty());
    }

    #[test]
    fn test_dotted_path_retrieval() {
        let dict = testdict::dictionary();

        let mut inner = DiameterAvp::new("Igor-myGrouped", AvpValue::Grouped(Vec::new()), &dict).unwrap();
        inner
            .add_avp(DiameterAvp::new("Igor-myInteger32", 1i32, &dict).unwrap())
            .unwrap()
            .add_avp(DiameterAvp::new("Igor-myString", "hello", &dict).unwrap())
            .unwrap();
        let mut outer = DiameterAvp::new("Igor-myGroupedInGrouped", AvpValue::Grouped(Vec::new()), &dict).unwrap();
        outer.add_avp(inner).unwrap();

        let mut message = test_request(&dict);
        message.add_avp(outer);

        let rebuilt = DiameterMessage::from_bytes(&message.to_bytes(), &dict).unwrap();
        assert_eq!(
            rebuilt.get_str_avp("Igor-myGroupedInGrouped.Igor-myGrouped.Igor-myString"),
            "hello"
        );
        assert_eq!(
            rebuilt.get_int_avp("Igor-myGroupedInGrouped.Igor-myGrouped.Igor-myInteger32"),
            Some(1)
        );
        assert_eq!(rebuilt.get_str_avp("Igor-myGroupedInGrouped.missing"), "");
    }

    #[test]
    fn test_check_attributes() {
        let dict = testdict::dictionary();

        let mut message = test_request(&dict);
        assert!(message.check_attributes(&dict).is_ok());

        // An attribute outside the schema fails
        message.add("Igor-myOctetString", "00112233", &dict).unwrap();
        assert!(message.check_attributes(&dict).is_err());
        message.delete_all_avp("Igor-myOctetString");

        // Removing an attribute with minimum occurrence 1 fails
        message.delete_all_avp("Vendor-Id");
        assert!(message.check_attributes(&dict).is_err());
        message.add("Vendor-Id", 1001u32, &dict).unwrap();
        assert!(message.check_attributes(&dict).is_ok());

        // A grouped attribute missing a required child fails
        let grouped = DiameterAvp::new("Igor-myGrouped", AvpValue::Grouped(Vec::new()), &dict).unwrap();
        message.add_avp(grouped);
        assert!(message.check_attributes(&dict).is_err());
        message.delete_all_avp("Igor-myGrouped");

        // Too many session ids
        message.add("Session-Id", "another-session", &dict).unwrap();
        assert!(message.check_attributes(&dict).is_err());
    }

    #[test]
    fn test_copy_filters() {
        let dict = testdict::dictionary();
        let message = test_request(&dict);

        let positive = message.copy(&["Session-Id", "Vendor-Id"], &[]);
        assert_eq!(positive.get_str_avp("Session-Id"), "my-session-id");
        assert!(positive.get_avp("Destination-Realm").is_none());

        let negative = message.copy(&[], &["Session-Id"]);
        assert!(negative.get_avp("Session-Id").is_none());
        assert_eq!(negative.get_int_avp("Vendor-Id"), Some(1001));
    }

    #[tokio::test]
    async fn test_read_from_stream() {
        let dict = testdict::dictionary();
        let message = test_request(&dict);

        let mut bytes = message.to_bytes();
        // Append a second message to verify framing
        bytes.extend_from_slice(&message.to_bytes());

        let mut reader = bytes.as_slice();
        let first = DiameterMessage::read_from(&mut reader, &dict).await.unwrap();
        let second = DiameterMessage::read_from(&mut reader, &dict).await.unwrap();
        assert_eq!(first, message);
        assert_eq!(second, message);

        // EOF afterwards
        assert!(DiameterMessage::read_from(&mut reader, &dict).await.is_err());
    }
}
