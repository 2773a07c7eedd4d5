// Diameter command codes (base application)
pub const CMD_CAPABILITIES_EXCHANGE: u32 = 257;
pub const CMD_DEVICE_WATCHDOG: u32 = 280;
pub const CMD_DISCONNECT_PEER: u32 = 282;

// Diameter AVP codes (base application)
pub const AVP_HOST_IP_ADDRESS: u32 = 257;
pub const AVP_AUTH_APPLICATION_ID: u32 = 258;
pub const AVP_ACCT_APPLICATION_ID: u32 = 259;
pub const AVP_SESSION_ID: u32 = 263;
pub const AVP_ORIGIN_HOST: u32 = 264;
pub const AVP_VENDOR_ID: u32 = 266;
pub const AVP_FIRMWARE_REVISION: u32 = 267;
pub const AVP_RESULT_CODE: u32 = 268;
pub const AVP_PRODUCT_NAME: u32 = 269;
pub const AVP_DISCONNECT_CAUSE: u32 = 273;
pub const AVP_ORIGIN_STATE_ID: u32 = 278;
pub const AVP_ROUTE_RECORD: u32 = 282;
pub const AVP_DESTINATION_REALM: u32 = 283;
pub const AVP_DESTINATION_HOST: u32 = 293;
pub const AVP_ORIGIN_REALM: u32 = 296;

// Diameter Result-Code values (AVP 268)
pub const DIAMETER_SUCCESS: u32 = 2001;
pub const DIAMETER_LIMITED_SUCCESS: u32 = 2002;
pub const DIAMETER_UNABLE_TO_DELIVER: u32 = 3002;
pub const DIAMETER_REALM_NOT_SERVED: u32 = 3003;
pub const DIAMETER_INVALID_AVP_VALUE: u32 = 3008;
pub const DIAMETER_UNKNOWN_PEER: u32 = 3010;
pub const DIAMETER_MISSING_AVP: u32 = 5005;
pub const DIAMETER_UNABLE_TO_COMPLY: u32 = 5012;

// Application id for the base protocol
pub const APP_BASE: u32 = 0;

// Relay application, advertised when a routing rule matches any application
pub const APP_RELAY: u32 = 0xffffffff;

// RADIUS packet codes
pub const ACCESS_REQUEST: u8 = 1;
pub const ACCESS_ACCEPT: u8 = 2;
pub const ACCESS_REJECT: u8 = 3;
pub const ACCOUNTING_REQUEST: u8 = 4;
pub const ACCOUNTING_RESPONSE: u8 = 5;
pub const ACCESS_CHALLENGE: u8 = 11;
pub const DISCONNECT_REQUEST: u8 = 40;
pub const DISCONNECT_ACK: u8 = 41;
pub const DISCONNECT_NAK: u8 = 42;
pub const COA_REQUEST: u8 = 43;
pub const COA_ACK: u8 = 44;
pub const COA_NAK: u8 = 45;

// RADIUS attribute codes
pub const RADIUS_USER_NAME: u8 = 1;
pub const RADIUS_USER_PASSWORD: u8 = 2;
pub const RADIUS_VENDOR_SPECIFIC: u8 = 26;
pub const RADIUS_MESSAGE_AUTHENTICATOR: u8 = 80;

// Vendor id for Cisco VSAs (Cisco-AVPair)
pub const VENDOR_CISCO: u32 = 9;

// Maximum RADIUS datagram size per RFC 2865
pub const RADIUS_MAX_PACKET_SIZE: usize = 4096;

// Event channel capacity for the per-peer loop
pub const EVENT_LOOP_CAPACITY: usize = 100;
