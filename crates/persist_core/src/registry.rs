use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use crate::driver::Driver;

static DRIVERS: LazyLock<RwLock<HashMap<String, Arc<dyn Driver>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Registers a driver under its [`Driver::name`].
///
/// Registration happens at process initialization; later lookups treat the
/// registry as read-only. Re-registering a name replaces the previous entry
/// (useful for tests) and is logged.
pub fn register_driver(driver: Arc<dyn Driver>) {
    let name = driver.name().to_string();
    let mut drivers = DRIVERS.write().unwrap_or_else(|e| e.into_inner());

    if drivers.insert(name.clone(), driver).is_some() {
        log::warn!("driver {name:?} re-registered, replacing previous entry");
    }
}

/// Looks up a driver by registry name.
pub fn find_driver(name: &str) -> Option<Arc<dyn Driver>> {
    DRIVERS
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(name)
        .cloned()
}

/// Names of all registered drivers, unordered.
pub fn driver_names() -> Vec<String> {
    DRIVERS
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .keys()
        .cloned()
        .collect()
}
