//! Secret storage surface for guest code.
//!
//! The store itself is host-provided; guest code only sees save/get/remove/
//! clear over string keys. A store failure fails the operation in progress,
//! never the process, and values never appear in logs.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::RwLock;
use tonbridge_core::{GuestError, GuestValue, ScriptContext};
use tracing::debug;

use crate::error::{HostError, HostResult};

/// Host-side secret storage. Implementations decide durability and
/// encryption; the bridge only moves values across the boundary.
pub trait SecretStore: Send + Sync + 'static {
    fn save(&self, key: &str, value: &str) -> HostResult<()>;
    fn get(&self, key: &str) -> HostResult<Option<String>>;
    fn remove(&self, key: &str) -> HostResult<()>;
    fn clear(&self) -> HostResult<()>;
}

/// In-memory store. Suitable for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn save(&self, key: &str, value: &str) -> HostResult<()> {
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> HostResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn remove(&self, key: &str) -> HostResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn clear(&self) -> HostResult<()> {
        self.entries.write().clear();
        Ok(())
    }
}

fn key_arg(args: &[GuestValue]) -> Result<&str, GuestError> {
    args.first()
        .and_then(GuestValue::as_str)
        .ok_or_else(|| GuestError::type_error("secret key must be a string"))
}

fn storage_error(err: HostError) -> GuestError {
    GuestError::runtime(err.to_string())
}

/// Install the secret-store globals on the context.
pub fn install(ctx: &Rc<dyn ScriptContext>, store: Arc<dyn SecretStore>) {
    let global = ctx.global();

    {
        let store = store.clone();
        let save = ctx.create_function(
            "secretsSave",
            Rc::new(move |args| {
                let key = key_arg(args)?;
                let value = args
                    .get(1)
                    .and_then(GuestValue::as_str)
                    .ok_or_else(|| GuestError::type_error("secret value must be a string"))?;
                store.save(key, value).map_err(storage_error)?;
                debug!(key, "secret saved");
                Ok(GuestValue::Undefined)
            }),
        );
        global.set_member("secretsSave", GuestValue::Function(save));
    }

    {
        let store = store.clone();
        let get = ctx.create_function(
            "secretsGet",
            Rc::new(move |args| {
                let key = key_arg(args)?;
                match store.get(key).map_err(storage_error)? {
                    Some(value) => Ok(GuestValue::String(value)),
                    None => Ok(GuestValue::Null),
                }
            }),
        );
        global.set_member("secretsGet", GuestValue::Function(get));
    }

    {
        let store = store.clone();
        let remove = ctx.create_function(
            "secretsRemove",
            Rc::new(move |args| {
                let key = key_arg(args)?;
                store.remove(key).map_err(storage_error)?;
                debug!(key, "secret removed");
                Ok(GuestValue::Undefined)
            }),
        );
        global.set_member("secretsRemove", GuestValue::Function(remove));
    }

    {
        let clear = ctx.create_function(
            "secretsClear",
            Rc::new(move |_args| {
                store.clear().map_err(storage_error)?;
                debug!("secrets cleared");
                Ok(GuestValue::Undefined)
            }),
        );
        global.set_member("secretsClear", GuestValue::Function(clear));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonbridge_core::mock::MockContext;

    #[test]
    fn memory_store_round_trip() {
        let store = MemorySecretStore::new();
        assert_eq!(store.get("mnemonic").unwrap(), None);
        store.save("mnemonic", "abandon abandon about").unwrap();
        assert_eq!(
            store.get("mnemonic").unwrap().as_deref(),
            Some("abandon abandon about")
        );
        store.remove("mnemonic").unwrap();
        assert_eq!(store.get("mnemonic").unwrap(), None);

        store.save("a", "1").unwrap();
        store.save("b", "2").unwrap();
        store.clear().unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.get("b").unwrap(), None);
    }

    #[test]
    fn guest_surface_distinguishes_missing_from_present() {
        let ctx: Rc<dyn ScriptContext> = MockContext::new();
        install(&ctx, Arc::new(MemorySecretStore::new()));
        let global = ctx.global();

        let member = |name: &str| {
            global
                .get_member(name)
                .and_then(|v| v.as_function().cloned())
                .unwrap()
        };
        let save = member("secretsSave");
        let get = member("secretsGet");
        let remove = member("secretsRemove");
        let clear = member("secretsClear");

        let key = GuestValue::String("session".into());
        let missing = get.call(GuestValue::Undefined, &[key.clone()]).unwrap();
        assert!(missing.is_null());

        save.call(
            GuestValue::Undefined,
            &[key.clone(), GuestValue::String("token".into())],
        )
        .unwrap();
        let present = get.call(GuestValue::Undefined, &[key.clone()]).unwrap();
        assert_eq!(present.as_str(), Some("token"));

        remove.call(GuestValue::Undefined, &[key.clone()]).unwrap();
        assert!(
            get.call(GuestValue::Undefined, &[key.clone()])
                .unwrap()
                .is_null()
        );

        save.call(
            GuestValue::Undefined,
            &[key.clone(), GuestValue::String("again".into())],
        )
        .unwrap();
        clear.call(GuestValue::Undefined, &[]).unwrap();
        assert!(get.call(GuestValue::Undefined, &[key]).unwrap().is_null());

        let err = get.call(GuestValue::Undefined, &[]).unwrap_err();
        assert!(err.message.contains("string"));
    }
}
