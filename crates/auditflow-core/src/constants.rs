//! Constantes del motor core.
//!
//! Valores estáticos que participan en identidad y compatibilidad entre
//! corridas. `ENGINE_VERSION` y `CANONICAL_VERSION` se registran en cada run:
//! un cambio de canonicalización invalida la comparación de hashes entre
//! corridas y debe reflejarse aquí.

/// Versión lógica del motor. Se registra en cada run para que un cambio
/// incompatible del engine sea visible en el landscape.
pub const ENGINE_VERSION: &str = "1.0";

/// Etiqueta de la canonicalización vigente (algoritmo de hash + forma JSON).
pub const CANONICAL_VERSION: &str = "blake3-rfc8785-v1";

/// Longitud máxima de un node_id generado. Superarla es error de
/// configuración (nombres de plugin demasiado largos).
pub const NODE_ID_MAX_LENGTH: usize = 96;

/// Caracteres del hash de config incluidos en el node_id (48 bits).
pub const NODE_ID_HASH_LEN: usize = 12;

/// Etiquetas de edge reservadas por el motor. No pueden usarse como labels de
/// rutas de usuario ni como nombres de ramas de fork.
pub const RESERVED_EDGE_LABELS: &[&str] = &["continue", "on_success", "__quarantine__"];

/// Etiqueta estructural del edge de cuarentena de un source.
pub const QUARANTINE_EDGE_LABEL: &str = "__quarantine__";

/// Destino especial que descarta filas en vez de rutearlas a un sink.
pub const DISCARD_DESTINATION: &str = "discard";

/// Versión del payload de checkpoint. Un mismatch al restaurar es fatal.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Umbral de advertencia del tamaño de checkpoint (1 MB).
pub const CHECKPOINT_WARN_BYTES: usize = 1024 * 1024;

/// Tope duro del tamaño de checkpoint (10 MB).
pub const CHECKPOINT_MAX_BYTES: usize = 10 * 1024 * 1024;

/// Etiqueta estructural del edge de error de un transform.
pub fn error_edge_label(transform_name: &str) -> String {
    format!("__error_{transform_name}__")
}
