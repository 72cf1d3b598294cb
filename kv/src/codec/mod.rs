pub mod key;
pub mod value;

pub use key::{decode_key, display_key, encode_key, key_from_json, prefix_range, Key, KeyPart};
pub use value::{deserialize_value, serialize_value};
