//! Configuración de conexión desde variables de entorno / .env.

use dotenvy::dotenv;

/// Carga .env una sola vez (no pisa variables ya presentes).
pub fn init_dotenv() {
    let _ = dotenv();
}

/// Parámetros de conexión del pool.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub min_idle: u32,
    pub max_size: u32,
}

impl DbConfig {
    /// Lee `DATABASE_URL` (obligatoria) y tamaños de pool opcionales
    /// (`AUDITFLOW_POOL_MIN_IDLE`, `AUDITFLOW_POOL_MAX_SIZE`).
    pub fn from_env() -> Self {
        init_dotenv();
        let url = std::env::var("DATABASE_URL").unwrap_or_default();
        let min_idle = std::env::var("AUDITFLOW_POOL_MIN_IDLE").ok()
                                                               .and_then(|v| v.parse().ok())
                                                               .unwrap_or(1);
        let max_size = std::env::var("AUDITFLOW_POOL_MAX_SIZE").ok()
                                                               .and_then(|v| v.parse().ok())
                                                               .unwrap_or(5);
        Self { url, min_idle, max_size }
    }
}
