#[cfg(feature = "loom")]
mod models;
