//! Canonicalización JSON y helpers de hash.
//!
//! Todo hash del landscape (`input_hash`, `output_hash`, `config_hash`,
//! `content_hash`, `source_data_hash`) es un digest BLAKE3 de la forma
//! canónica estilo RFC 8785: claves de objeto ordenadas, arrays en orden,
//! números con representación estable. Valores no serializables (NaN, ±∞)
//! se rechazan en la frontera.

mod canonical_json;
mod hash;

pub use canonical_json::{finite_number, to_canonical_json};
pub use hash::{hash_str, hash_value};
