pub mod accounting;
pub mod error;
pub mod hash;
pub mod raw;
pub mod registry;
pub mod site;
