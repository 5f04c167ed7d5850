//! Row encodings for mixed-width batches
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

pub mod encoding;

pub use self::encoding::{CatEncoder, EncodingError};
