//! Contratos de esquema: el descriptor de forma que viaja con cada fila.
//!
//! Rol en el flujo:
//! - Cada `PipelineRow` lleva un contrato compartido (`Arc`) que describe los
//!   campos esperados y su procedencia.
//! - El modo gobierna la tolerancia a extras: `Fixed` rechaza, `Flexible`
//!   acepta manteniendo prioridad de orden de inserción para los declarados,
//!   `Observed` infiere el contrato desde los datos.
//! - `version()` es un hash determinista de la estructura normalizada; es
//!   estable entre ejecuciones para entradas idénticas (requisito de
//!   recuperación: los contratos se re-resuelven por versión al restaurar).
//!
//! Un contrato bloqueado (`locked`) es inmutable: cualquier intento de
//! extenderlo es un error del llamador, no una mutación silenciosa.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::errors::DomainError;
use crate::field::{FieldContract, FieldSource, FieldType};

/// Modo de tolerancia del contrato frente a campos no declarados.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractMode {
    Fixed,
    Flexible,
    Observed,
}

impl ContractMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractMode::Fixed => "fixed",
            ContractMode::Flexible => "flexible",
            ContractMode::Observed => "observed",
        }
    }

    pub fn parse(s: &str) -> Option<ContractMode> {
        match s {
            "fixed" => Some(ContractMode::Fixed),
            "flexible" => Some(ContractMode::Flexible),
            "observed" => Some(ContractMode::Observed),
            _ => None,
        }
    }
}

/// Descriptor de esquema con tupla ordenada de campos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaContract {
    mode: ContractMode,
    fields: Vec<FieldContract>,
    locked: bool,
}

impl SchemaContract {
    /// Contrato declarado con la tupla de campos dada.
    pub fn new(mode: ContractMode, fields: Vec<FieldContract>) -> Self {
        Self { mode, fields, locked: false }
    }

    /// Contrato `Observed` vacío: se completa con `observe()`.
    pub fn observed() -> Self {
        Self { mode: ContractMode::Observed,
               fields: Vec::new(),
               locked: false }
    }

    pub fn mode(&self) -> ContractMode {
        self.mode
    }

    pub fn fields(&self) -> &[FieldContract] {
        &self.fields
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn field(&self, name: &str) -> Option<&FieldContract> {
        self.fields.iter().find(|f| f.normalized_name == name)
    }

    /// Bloquea el contrato. A partir de aquí es inmutable.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    /// Variante bloqueada por valor (útil al construir contratos fijos).
    pub fn locked(mut self) -> Self {
        self.lock();
        self
    }

    /// Incorpora campos observados desde un mapeo de datos.
    ///
    /// Sólo válido en modo `Observed` y con el contrato sin bloquear. Los
    /// campos ya conocidos no cambian de tipo: una observación posterior con
    /// tipo distinto degrada el campo a `any` (nunca se adivina).
    pub fn observe<'a, I>(&mut self, pairs: I) -> Result<(), DomainError>
        where I: IntoIterator<Item = (&'a String, &'a Value)>
    {
        if self.locked {
            return Err(DomainError::ContractLocked("observe() sobre contrato bloqueado".to_string()));
        }
        if self.mode != ContractMode::Observed {
            return Err(DomainError::ValidationError("observe() sólo aplica a contratos observed".to_string()));
        }
        for (name, value) in pairs {
            match self.fields.iter_mut().find(|f| &f.normalized_name == name) {
                Some(existing) => {
                    let seen = FieldType::infer(value);
                    if existing.field_type != seen && existing.field_type != FieldType::Any {
                        existing.field_type = FieldType::Any;
                    }
                }
                None => self.fields.push(FieldContract::inferred(name, value)),
            }
        }
        Ok(())
    }

    /// Valida un mapeo de datos contra el contrato.
    ///
    /// - `Fixed`: extras son error; requeridos ausentes son error.
    /// - `Flexible`: extras permitidos; requeridos ausentes son error.
    /// - `Observed`: siempre acepta (el contrato se construye desde datos).
    pub fn validate<'a, I>(&self, pairs: I) -> Result<(), DomainError>
        where I: IntoIterator<Item = (&'a String, &'a Value)> + Clone
    {
        if self.mode == ContractMode::Observed {
            return Ok(());
        }
        for (name, value) in pairs.clone() {
            match self.field(name) {
                Some(fc) => {
                    if !fc.field_type.accepts(value) {
                        return Err(DomainError::TypeMismatch { field: name.clone(),
                                                               expected: fc.field_type.as_str().to_string(),
                                                               actual: FieldType::infer(value).as_str().to_string() });
                    }
                }
                None if self.mode == ContractMode::Fixed => {
                    return Err(DomainError::UnknownField { field: name.clone() });
                }
                None => {}
            }
        }
        for fc in &self.fields {
            if fc.required && !pairs.clone().into_iter().any(|(n, _)| n == &fc.normalized_name) {
                return Err(DomainError::MissingField { field: fc.normalized_name.clone() });
            }
        }
        Ok(())
    }

    /// Forma canónica de la estructura normalizada.
    ///
    /// Es la entrada del hash de versión: claves en orden fijo, campos en el
    /// orden de la tupla (el orden ES parte de la identidad del contrato).
    pub fn canonical_form(&self) -> String {
        let mut out = String::new();
        out.push_str("{\"fields\":[");
        for (i, f) in self.fields.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&format!("{{\"name\":{},\"original\":{},\"required\":{},\"source\":\"{}\",\"type\":\"{}\"}}",
                                  serde_json::to_string(&f.normalized_name).unwrap_or_default(),
                                  serde_json::to_string(&f.original_name).unwrap_or_default(),
                                  f.required,
                                  f.source.as_str(),
                                  f.field_type.as_str()));
        }
        out.push_str(&format!("],\"locked\":{},\"mode\":\"{}\"}}", self.locked, self.mode.as_str()));
        out
    }

    /// Hash de versión estable (hex) de la forma canónica.
    pub fn version(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_form().as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(64);
        for b in digest {
            hex.push_str(&format!("{:02x}", b));
        }
        hex
    }

    /// Representación JSON de la estructura (para registro en auditoría).
    pub fn to_schema_json(&self) -> Value {
        serde_json::json!({
            "mode": self.mode.as_str(),
            "fields": self.fields.iter().map(|f| {
                serde_json::json!({
                    "name": f.normalized_name,
                    "type": f.field_type.as_str(),
                    "required": f.required,
                    "source": f.source.as_str(),
                })
            }).collect::<Vec<_>>(),
        })
    }

    /// Reconstruye un contrato desde la representación de `to_schema_json`.
    /// Entradas malformadas son errores de corrupción: no se tolera ni un
    /// campo sin nombre ni un tipo desconocido.
    pub fn from_schema_json(value: &Value) -> Result<Self, DomainError> {
        let mode_str = value.get("mode")
                            .and_then(|m| m.as_str())
                            .ok_or_else(|| DomainError::ValidationError("schema sin 'mode'".to_string()))?;
        let mode = ContractMode::parse(mode_str)
            .ok_or_else(|| DomainError::ValidationError(format!("modo de contrato desconocido: '{mode_str}'")))?;
        let mut fields = Vec::new();
        if let Some(list) = value.get("fields").and_then(|f| f.as_array()) {
            for entry in list {
                let name = entry.get("name")
                                .and_then(|n| n.as_str())
                                .ok_or_else(|| DomainError::ValidationError("campo de schema sin 'name'".to_string()))?;
                let type_str = entry.get("type")
                                    .and_then(|t| t.as_str())
                                    .ok_or_else(|| DomainError::ValidationError("campo de schema sin 'type'".to_string()))?;
                let field_type = FieldType::parse(type_str)
                    .ok_or_else(|| DomainError::ValidationError(format!("tipo de campo desconocido: '{type_str}'")))?;
                let required = entry.get("required").and_then(|r| r.as_bool()).unwrap_or(true);
                let source = match entry.get("source").and_then(|s| s.as_str()) {
                    Some("inferred") => FieldSource::Inferred,
                    _ => FieldSource::Declared,
                };
                fields.push(FieldContract { normalized_name: name.to_string(),
                                            original_name: name.to_string(),
                                            field_type,
                                            required,
                                            source });
            }
        }
        Ok(SchemaContract { mode, fields, locked: true })
    }
}
