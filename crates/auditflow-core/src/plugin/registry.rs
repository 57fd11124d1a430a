//! Registro tipado de plugins.
//!
//! Tabla de capacidades keyed por nombre: cada entrada es un constructor que
//! recibe las options del YAML y devuelve el objeto de capacidad apropiado.
//! El registro se inyecta al inicio del run y se captura por valor después;
//! no hay estado global mutable.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::traits::{GatePlugin, SinkPlugin, SourcePlugin, TransformPlugin};
use crate::dag::suggest_similar;
use crate::errors::EngineError;

type SourceCtor = Arc<dyn Fn(&Value) -> Result<Box<dyn SourcePlugin>, EngineError> + Send + Sync>;
type TransformCtor = Arc<dyn Fn(&Value) -> Result<Box<dyn TransformPlugin>, EngineError> + Send + Sync>;
type GateCtor = Arc<dyn Fn(&Value) -> Result<Box<dyn GatePlugin>, EngineError> + Send + Sync>;
type SinkCtor = Arc<dyn Fn(&Value) -> Result<Box<dyn SinkPlugin>, EngineError> + Send + Sync>;

/// Tabla de constructores por rol.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    sources: HashMap<String, SourceCtor>,
    transforms: HashMap<String, TransformCtor>,
    gates: HashMap<String, GateCtor>,
    sinks: HashMap<String, SinkCtor>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source<F>(&mut self, name: &str, ctor: F)
        where F: Fn(&Value) -> Result<Box<dyn SourcePlugin>, EngineError> + Send + Sync + 'static
    {
        self.sources.insert(name.to_string(), Arc::new(ctor));
    }

    pub fn register_transform<F>(&mut self, name: &str, ctor: F)
        where F: Fn(&Value) -> Result<Box<dyn TransformPlugin>, EngineError> + Send + Sync + 'static
    {
        self.transforms.insert(name.to_string(), Arc::new(ctor));
    }

    pub fn register_gate<F>(&mut self, name: &str, ctor: F)
        where F: Fn(&Value) -> Result<Box<dyn GatePlugin>, EngineError> + Send + Sync + 'static
    {
        self.gates.insert(name.to_string(), Arc::new(ctor));
    }

    pub fn register_sink<F>(&mut self, name: &str, ctor: F)
        where F: Fn(&Value) -> Result<Box<dyn SinkPlugin>, EngineError> + Send + Sync + 'static
    {
        self.sinks.insert(name.to_string(), Arc::new(ctor));
    }

    pub fn create_source(&self, name: &str, options: &Value) -> Result<Box<dyn SourcePlugin>, EngineError> {
        let ctor = self.sources
                       .get(name)
                       .ok_or_else(|| unknown_plugin("source", name, self.sources.keys()))?;
        ctor(options)
    }

    pub fn create_transform(&self, name: &str, options: &Value) -> Result<Box<dyn TransformPlugin>, EngineError> {
        let ctor = self.transforms
                       .get(name)
                       .ok_or_else(|| unknown_plugin("transform", name, self.transforms.keys()))?;
        ctor(options)
    }

    pub fn create_gate(&self, name: &str, options: &Value) -> Result<Box<dyn GatePlugin>, EngineError> {
        let ctor = self.gates
                       .get(name)
                       .ok_or_else(|| unknown_plugin("gate", name, self.gates.keys()))?;
        ctor(options)
    }

    pub fn create_sink(&self, name: &str, options: &Value) -> Result<Box<dyn SinkPlugin>, EngineError> {
        let ctor = self.sinks
                       .get(name)
                       .ok_or_else(|| unknown_plugin("sink", name, self.sinks.keys()))?;
        ctor(options)
    }
}

fn unknown_plugin<'a, I>(role: &str, name: &str, known: I) -> EngineError
    where I: Iterator<Item = &'a String>
{
    let candidates: Vec<String> = known.cloned().collect();
    let suggestions = suggest_similar(name, &candidates);
    let hint = if suggestions.is_empty() {
        String::new()
    } else {
        format!(" Did you mean: {}?", suggestions.join(", "))
    };
    EngineError::Config(format!("unknown {role} plugin '{name}'.{hint} Available: {}", candidates.join(", ")))
}
