use std::sync::Arc;

use igor_core::Result;
use igor_dict::freeradius::parse_freeradius_dictionary;
use igor_dict::RadiusDictionary;

pub const TEST_DICTIONARY: &str = r#"
ATTRIBUTE   User-Name               1   string
ATTRIBUTE   User-Password           2   string  encrypt=1
ATTRIBUTE   Class                   25  octets
ATTRIBUTE   Reply-Message           18  string
"#;

pub fn dictionary() -> Arc<RadiusDictionary> {
    let no_includes = |name: &str| -> Result<String> {
        Err(igor_core::IgorError::Config(format!(
            "unexpected include {name}"
        )))
    };
    Arc::new(parse_freeradius_dictionary(TEST_DICTIONARY, &no_includes).unwrap())
}

pub fn clients_json(secret: &str) -> String {
    format!(
        r#"[{{"name": "loopback", "ipAddress": "127.0.0.0/8", "secret": "{secret}"}}]"#
    )
}
