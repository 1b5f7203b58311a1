use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::CoreError;

/// Mutable data shared by the steps of one flow chain run.
///
/// A fresh context is created for every chain execution and handed to the
/// terminal handler when the chain finishes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowContext {
    data: HashMap<String, Value>,
}

impl FlowContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a context with initial values
    pub fn with_data(data: HashMap<String, Value>) -> Self {
        Self { data }
    }

    /// Store a serializable value under `key`
    pub fn put<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> Result<(), CoreError> {
        let value = serde_json::to_value(value)?;
        self.data.insert(key.into(), value);
        Ok(())
    }

    /// Store a raw JSON value under `key`
    pub fn put_value(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Read and deserialize the value stored under `key`
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CoreError> {
        match self.data.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Borrow the raw JSON value stored under `key`
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Remove and return the value stored under `key`
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    /// Whether a value is stored under `key`
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Keys currently stored
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.data.keys()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the context is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Consume the context, returning the underlying map
    pub fn into_inner(self) -> HashMap<String, Value> {
        self.data
    }
}
