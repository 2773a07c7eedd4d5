use std::collections::HashMap;
use std::sync::Arc;

use igor_core::{IgorError, Result};

use crate::radius::{RadiusAvpDef, RadiusDictionary, RadiusType};

/// Resolver for `$INCLUDE` directives. Maps an included dictionary name to
/// its text, typically through the configuration object reader.
pub type IncludeResolver<'a> = dyn Fn(&str) -> Result<String> + 'a;

/// Parse a dictionary in the FreeRADIUS textual grammar.
///
/// Recognized directives: `$INCLUDE`, `VENDOR`, `BEGIN-VENDOR`,
/// `END-VENDOR`, `ATTRIBUTE` and `VALUE`. Unrecognized attribute flag
/// tokens fail the load; `vsa` typed entries are filtered out.
pub fn parse_freeradius_dictionary(
    text: &str,
    resolver: &IncludeResolver,
) -> Result<RadiusDictionary> {
    let mut state = ParserState::default();
    parse_into(text, resolver, &mut state)?;
    Ok(state.freeze())
}

#[derive(Default)]
struct ParserState {
    vendors_by_name: HashMap<String, u32>,
    // Entries in declaration order; VALUE lines mutate the last matching
    // attribute of the current vendor
    entries: Vec<RadiusAvpDef>,
    current_vendor: u32,
}

impl ParserState {
    fn freeze(self) -> RadiusDictionary {
        let mut dict = RadiusDictionary {
            vendors_by_name: self.vendors_by_name,
            ..RadiusDictionary::default()
        };
        for mut entry in self.entries {
            entry.enum_names = entry
                .enum_values
                .iter()
                .map(|(name, value)| (*value, name.clone()))
                .collect();
            let def = Arc::new(entry);
            dict.avps_by_name.insert(def.name.clone(), def.clone());
            dict.avps_by_code.insert((def.vendor_id, def.code), def);
        }
        dict
    }
}

fn parse_into(text: &str, resolver: &IncludeResolver, state: &mut ParserState) -> Result<()> {
    for raw_line in text.lines() {
        // Strip comments
        let line = match raw_line.find('#') {
            Some(pos) => &raw_line[..pos],
            None => raw_line,
        };

        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }

        match words[0] {
            "$INCLUDE" => {
                let name = expect_word(&words, 1, line)?;
                let included = resolver(name).map_err(|e| {
                    IgorError::Config(format!("dictionary {name} with error {e}"))
                })?;
                parse_into(&included, resolver, state)?;
            }

            "VENDOR" => {
                let name = expect_word(&words, 1, line)?;
                let vendor_id: u32 = expect_word(&words, 2, line)?
                    .parse()
                    .map_err(|_| IgorError::Config(format!("invalid VENDOR {line}")))?;
                state.vendors_by_name.insert(name.to_string(), vendor_id);
            }

            "BEGIN-VENDOR" => {
                let name = expect_word(&words, 1, line)?;
                state.current_vendor = *state
                    .vendors_by_name
                    .get(name)
                    .ok_or_else(|| IgorError::Config(format!("vendor {name} not found")))?;
            }

            "END-VENDOR" => {
                state.current_vendor = 0;
            }

            "ATTRIBUTE" => {
                let name = expect_word(&words, 1, line)?;
                let code: u8 = expect_word(&words, 2, line)?
                    .parse()
                    .map_err(|_| IgorError::Config(format!("invalid ATTRIBUTE {line}")))?;
                let radius_type = parse_radius_type(expect_word(&words, 3, line)?)?;

                let mut tagged = false;
                let mut encrypted = false;
                let mut salted = false;
                let mut withlen = false;
                if let Some(options) = words.get(4) {
                    for option in options.split(',') {
                        match option {
                            "has_tag" => tagged = true,
                            "encrypt=1" => encrypted = true,
                            "encrypt=2" => {
                                salted = true;
                                withlen = true;
                            }
                            // Not in freeradius, used for tagged salted VSAs
                            "encrypt=8" => {
                                tagged = true;
                                salted = true;
                            }
                            // Not in freeradius, salted without length
                            "encrypt=9" => salted = true,
                            "abinary" => {}
                            _ => {
                                return Err(IgorError::Config(format!(
                                    "invalid ATTRIBUTE {line}"
                                )))
                            }
                        }
                    }
                }

                if radius_type != RadiusType::Vsa {
                    state.entries.push(RadiusAvpDef {
                        code,
                        vendor_id: state.current_vendor,
                        name: name.to_string(),
                        radius_type,
                        tagged,
                        encrypted,
                        salted,
                        withlen,
                        enum_values: HashMap::new(),
                        enum_names: HashMap::new(),
                    });
                }
            }

            "VALUE" => {
                let attr_name = expect_word(&words, 1, line)?;
                let value_name = expect_word(&words, 2, line)?;
                let value: u32 = expect_word(&words, 3, line)?
                    .parse()
                    .map_err(|_| IgorError::Config(format!("invalid VALUE {line}")))?;

                let current_vendor = state.current_vendor;
                if let Some(entry) = state
                    .entries
                    .iter_mut()
                    .find(|e| e.vendor_id == current_vendor && e.name == attr_name)
                {
                    entry.enum_values.insert(value_name.to_string(), value);
                }
            }

            // Other directives (FLAGS, ATTRIBUTE extensions, etc.) are not
            // used by this server
            _ => {}
        }
    }

    Ok(())
}

fn expect_word<'a>(words: &[&'a str], index: usize, line: &str) -> Result<&'a str> {
    words
        .get(index)
        .copied()
        .ok_or_else(|| IgorError::Config(format!("short dictionary line {line}")))
}

fn parse_radius_type(token: &str) -> Result<RadiusType> {
    let radius_type = match token {
        "integer" | "byte" | "short" | "signed" | "time_delta" => RadiusType::Integer,
        "string" => RadiusType::String,
        "octets" | "abinary" | "struct" => RadiusType::Octets,
        "ipaddr" => RadiusType::Address,
        "date" => RadiusType::Time,
        "ipv6addr" => RadiusType::IPv6Address,
        "ipv6prefix" => RadiusType::IPv6Prefix,
        "ifid" => RadiusType::InterfaceId,
        // Not in freeradius
        "integer64" => RadiusType::Integer64,
        "vsa" => RadiusType::Vsa,
        other => {
            // Freeradius sometimes writes octets[size]
            if other.starts_with("octets") {
                RadiusType::Octets
            } else {
                return Err(IgorError::Config(format!(
                    "unrecognized attribute type {other}"
                )));
            }
        }
    };
    Ok(radius_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_DICT: &str = r#"
# Test dictionary
ATTRIBUTE   User-Name       1   string
ATTRIBUTE   User-Password   2   string  encrypt=1
ATTRIBUTE   NAS-Port        5   integer
ATTRIBUTE   Tunnel-Type     64  integer has_tag
ATTRIBUTE   Vendor-Specific 26  vsa

VALUE   NAS-Port    Zero    0
VALUE   NAS-Port    One     1

VENDOR      Igor    9001
BEGIN-VENDOR    Igor
ATTRIBUTE   Igor-SaltedOctetsAttribute  1   octets  encrypt=2
ATTRIBUTE   Igor-TaggedSaltedAttribute  2   octets  encrypt=8
ATTRIBUTE   Igor-Integer64Attribute     3   integer64
END-VENDOR  Igor
"#;

    fn no_includes(name: &str) -> Result<String> {
        Err(IgorError::Config(format!("unexpected include {name}")))
    }

    #[test]
    fn test_attribute_parsing() {
        let dict = parse_freeradius_dictionary(TEST_DICT, &no_includes).unwrap();

        let user_password = dict.avp_by_name("User-Password").unwrap();
        assert_eq!(user_password.code, 2);
        assert_eq!(user_password.vendor_id, 0);
        assert!(user_password.encrypted);
        assert!(!user_password.salted);

        let tunnel_type = dict.avp_by_name("Tunnel-Type").unwrap();
        assert!(tunnel_type.tagged);
        assert_eq!(tunnel_type.radius_type, RadiusType::Integer);
    }

    #[test]
    fn test_vendor_attributes() {
        let dict = parse_freeradius_dictionary(TEST_DICT, &no_includes).unwrap();

        assert_eq!(dict.vendor_by_name("Igor"), Some(9001));

        let salted = dict.avp_by_code(9001, 1);
        assert_eq!(salted.name, "Igor-SaltedOctetsAttribute");
        assert!(salted.salted);
        assert!(salted.withlen);

        let tagged_salted = dict.avp_by_name("Igor-TaggedSaltedAttribute").unwrap();
        assert!(tagged_salted.tagged);
        assert!(tagged_salted.salted);
        assert!(!tagged_salted.withlen);

        let integer64 = dict.avp_by_name("Igor-Integer64Attribute").unwrap();
        assert_eq!(integer64.radius_type, RadiusType::Integer64);
    }

    #[test]
    fn test_vsa_filtered_and_values() {
        let dict = parse_freeradius_dictionary(TEST_DICT, &no_includes).unwrap();

        assert!(dict.avp_by_name("Vendor-Specific").is_err());

        let nas_port = dict.avp_by_name("NAS-Port").unwrap();
        assert_eq!(nas_port.enum_values.get("One"), Some(&1));
        assert_eq!(nas_port.enum_names.get(&0).unwrap(), "Zero");
    }

    #[test]
    fn test_invalid_flag_token_fails() {
        let text = "ATTRIBUTE Bad-Attribute 10 string encrypt=7\n";
        assert!(parse_freeradius_dictionary(text, &no_includes).is_err());
    }

    #[test]
    fn test_include() {
        let resolver = |name: &str| -> Result<String> {
            if name == "dictionary.igor" {
                Ok("ATTRIBUTE Included-Attribute 99 string\n".to_string())
            } else {
                Err(IgorError::Config(format!("no such dictionary {name}")))
            }
        };
        let dict =
            parse_freeradius_dictionary("$INCLUDE dictionary.igor\n", &resolver).unwrap();
        assert_eq!(dict.avp_by_name("Included-Attribute").unwrap().code, 99);

        assert!(parse_freeradius_dictionary("$INCLUDE missing.dict\n", &no_includes).is_err());
    }
}
