use resound_core::collections::HashMap;

pub const DEVICE_DESCRIPTION: &str = "device.description";
pub const DEVICE_CLASS: &str = "device.class";

/// A free-form string property bag attached to every device object.
#[derive(Debug, Clone, Default)]
pub struct Proplist {
    entries: HashMap<String, String>,
}

impl Proplist {
    pub fn new() -> Proplist {
        Proplist::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn unset(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
