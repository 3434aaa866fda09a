#[cfg(feature = "backdoor")]
pub mod backdoor;
