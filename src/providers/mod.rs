pub mod canned;
pub mod fresh;
pub mod local;
