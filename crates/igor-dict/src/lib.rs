// Diameter dictionary module
pub mod diameter;

// RADIUS dictionary and FreeRADIUS grammar parser
pub mod freeradius;
pub mod radius;

// Re-export commonly used types
pub use diameter::{
    CommandDef, DiameterApplication, DiameterAvpDef, DiameterDictionary, DiameterType, Occurs,
};
pub use radius::{RadiusAvpDef, RadiusDictionary, RadiusType};
