//! NVS-backed key/value store.
//!
//! Implements [`StoragePort`] over ESP-IDF NVS. First-use init erases and
//! re-initialises the partition when the backing flash is unreadable
//! (no free pages / version mismatch), matching the IDF recommendation.
//! The simulation backend is a plain `HashMap` with the same namespace
//! isolation.
//!
//! NVS keys are limited to 15 characters; every key this crate uses fits.

use crate::app::ports::{StorageError, StoragePort};
use log::info;

#[cfg(not(target_os = "espidf"))]
use std::collections::HashMap;

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

pub struct NvsStore {
    #[cfg(not(target_os = "espidf"))]
    entries: HashMap<String, Entry>,
}

#[cfg(not(target_os = "espidf"))]
#[derive(Debug, Clone)]
enum Entry {
    U64(u64),
    Str(String),
    Blob(Vec<u8>),
}

impl NvsStore {
    /// Initialise NVS flash. Idempotent; erases the partition and retries
    /// once when the first init reports unreadable storage.
    pub fn new() -> Result<Self, StorageError> {
        #[cfg(target_os = "espidf")]
        {
            // SAFETY: nvs_flash_init / nvs_flash_erase run from the single
            // boot context before any concurrent NVS access.
            let ret = unsafe { nvs_flash_init() };
            if ret == ESP_ERR_NVS_NO_FREE_PAGES || ret == ESP_ERR_NVS_NEW_VERSION_FOUND {
                log::warn!("nvs: erasing and re-initialising flash partition");
                if unsafe { nvs_flash_erase() } != ESP_OK {
                    return Err(StorageError::IoError);
                }
                if unsafe { nvs_flash_init() } != ESP_OK {
                    return Err(StorageError::IoError);
                }
            } else if ret != ESP_OK {
                return Err(StorageError::IoError);
            }
            info!("nvs: ESP-IDF backend initialised");
            Ok(Self {})
        }

        #[cfg(not(target_os = "espidf"))]
        {
            info!("nvs: simulation backend");
            Ok(Self {
                entries: HashMap::new(),
            })
        }
    }

    #[cfg(not(target_os = "espidf"))]
    fn composite(namespace: &str, key: &str) -> String {
        format!("{namespace}::{key}")
    }

    /// Open an NVS namespace, run a closure with the handle, then close.
    #[cfg(target_os = "espidf")]
    fn with_handle<F, T>(namespace: &str, write: bool, f: F) -> Result<T, i32>
    where
        F: FnOnce(nvs_handle_t) -> Result<T, i32>,
    {
        let mut ns_buf = [0u8; 16];
        let ns = namespace.as_bytes();
        let len = ns.len().min(15);
        ns_buf[..len].copy_from_slice(&ns[..len]);

        let mode = if write {
            nvs_open_mode_t_NVS_READWRITE
        } else {
            nvs_open_mode_t_NVS_READONLY
        };

        let mut handle: nvs_handle_t = 0;
        let ret = unsafe { nvs_open(ns_buf.as_ptr() as *const _, mode, &mut handle) };
        if ret != ESP_OK {
            return Err(ret);
        }
        let result = f(handle);
        unsafe {
            nvs_close(handle);
        }
        result
    }

    #[cfg(target_os = "espidf")]
    fn key_buf(key: &str) -> [u8; 16] {
        let mut buf = [0u8; 16];
        let kb = key.as_bytes();
        let len = kb.len().min(15);
        buf[..len].copy_from_slice(&kb[..len]);
        buf
    }

    #[cfg(target_os = "espidf")]
    fn commit(handle: nvs_handle_t) -> Result<(), i32> {
        let ret = unsafe { nvs_commit(handle) };
        if ret != ESP_OK {
            return Err(ret);
        }
        Ok(())
    }
}

impl StoragePort for NvsStore {
    fn get_u64(&self, namespace: &str, key: &str) -> Option<u64> {
        #[cfg(not(target_os = "espidf"))]
        {
            match self.entries.get(&Self::composite(namespace, key)) {
                Some(Entry::U64(v)) => Some(*v),
                _ => None,
            }
        }

        #[cfg(target_os = "espidf")]
        {
            Self::with_handle(namespace, false, |handle| {
                let key = Self::key_buf(key);
                let mut out: u64 = 0;
                let ret = unsafe { nvs_get_u64(handle, key.as_ptr() as *const _, &mut out) };
                if ret != ESP_OK {
                    return Err(ret);
                }
                Ok(out)
            })
            .ok()
        }
    }

    fn set_u64(&mut self, namespace: &str, key: &str, value: u64) -> Result<(), StorageError> {
        #[cfg(not(target_os = "espidf"))]
        {
            self.entries
                .insert(Self::composite(namespace, key), Entry::U64(value));
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            Self::with_handle(namespace, true, |handle| {
                let key = Self::key_buf(key);
                let ret = unsafe { nvs_set_u64(handle, key.as_ptr() as *const _, value) };
                if ret != ESP_OK {
                    return Err(ret);
                }
                Self::commit(handle)
            })
            .map_err(|_| StorageError::IoError)
        }
    }

    fn get_str(&self, namespace: &str, key: &str) -> Option<String> {
        #[cfg(not(target_os = "espidf"))]
        {
            match self.entries.get(&Self::composite(namespace, key)) {
                Some(Entry::Str(v)) => Some(v.clone()),
                _ => None,
            }
        }

        #[cfg(target_os = "espidf")]
        {
            Self::with_handle(namespace, false, |handle| {
                let key = Self::key_buf(key);
                let mut len: usize = 0;
                let ret = unsafe {
                    nvs_get_str(handle, key.as_ptr() as *const _, core::ptr::null_mut(), &mut len)
                };
                if ret != ESP_OK || len == 0 {
                    return Err(ret);
                }
                let mut buf = vec![0u8; len];
                let ret = unsafe {
                    nvs_get_str(handle, key.as_ptr() as *const _, buf.as_mut_ptr() as *mut _, &mut len)
                };
                if ret != ESP_OK {
                    return Err(ret);
                }
                // strip the trailing NUL
                while buf.last() == Some(&0) {
                    buf.pop();
                }
                String::from_utf8(buf).map_err(|_| ESP_FAIL)
            })
            .ok()
        }
    }

    fn set_str(&mut self, namespace: &str, key: &str, value: &str) -> Result<(), StorageError> {
        #[cfg(not(target_os = "espidf"))]
        {
            self.entries
                .insert(Self::composite(namespace, key), Entry::Str(value.to_string()));
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            let mut cstr = value.as_bytes().to_vec();
            cstr.push(0);
            Self::with_handle(namespace, true, |handle| {
                let key = Self::key_buf(key);
                let ret = unsafe {
                    nvs_set_str(handle, key.as_ptr() as *const _, cstr.as_ptr() as *const _)
                };
                if ret != ESP_OK {
                    return Err(ret);
                }
                Self::commit(handle)
            })
            .map_err(|_| StorageError::IoError)
        }
    }

    fn get_blob(&self, namespace: &str, key: &str) -> Option<Vec<u8>> {
        #[cfg(not(target_os = "espidf"))]
        {
            match self.entries.get(&Self::composite(namespace, key)) {
                Some(Entry::Blob(v)) => Some(v.clone()),
                _ => None,
            }
        }

        #[cfg(target_os = "espidf")]
        {
            Self::with_handle(namespace, false, |handle| {
                let key = Self::key_buf(key);
                let mut len: usize = 0;
                let ret = unsafe {
                    nvs_get_blob(handle, key.as_ptr() as *const _, core::ptr::null_mut(), &mut len)
                };
                if ret != ESP_OK || len == 0 {
                    return Err(ret);
                }
                let mut buf = vec![0u8; len];
                let ret = unsafe {
                    nvs_get_blob(handle, key.as_ptr() as *const _, buf.as_mut_ptr() as *mut _, &mut len)
                };
                if ret != ESP_OK {
                    return Err(ret);
                }
                buf.truncate(len);
                Ok(buf)
            })
            .ok()
        }
    }

    fn set_blob(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        #[cfg(not(target_os = "espidf"))]
        {
            self.entries
                .insert(Self::composite(namespace, key), Entry::Blob(value.to_vec()));
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            Self::with_handle(namespace, true, |handle| {
                let key = Self::key_buf(key);
                let ret = unsafe {
                    nvs_set_blob(
                        handle,
                        key.as_ptr() as *const _,
                        value.as_ptr() as *const _,
                        value.len(),
                    )
                };
                if ret != ESP_OK {
                    return Err(ret);
                }
                Self::commit(handle)
            })
            .map_err(|_| StorageError::IoError)
        }
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError> {
        #[cfg(not(target_os = "espidf"))]
        {
            self.entries.remove(&Self::composite(namespace, key));
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            Self::with_handle(namespace, true, |handle| {
                let key = Self::key_buf(key);
                let ret = unsafe { nvs_erase_key(handle, key.as_ptr() as *const _) };
                if ret != ESP_OK && ret != ESP_ERR_NVS_NOT_FOUND {
                    return Err(ret);
                }
                Self::commit(handle)
            })
            .map_err(|_| StorageError::IoError)
        }
    }
}

#[cfg(all(test, not(target_os = "espidf")))]
mod tests {
    use super::*;

    #[test]
    fn typed_round_trips() {
        let mut store = NvsStore::new().unwrap();
        store.set_u64("sec", "nonce_device", 42).unwrap();
        store.set_str("cfg", "runtime", "{}").unwrap();
        store.set_blob("diag", "counters", &[1, 2, 3]).unwrap();

        assert_eq!(store.get_u64("sec", "nonce_device"), Some(42));
        assert_eq!(store.get_str("cfg", "runtime").as_deref(), Some("{}"));
        assert_eq!(store.get_blob("diag", "counters"), Some(vec![1, 2, 3]));
    }

    #[test]
    fn missing_keys_read_as_none() {
        let store = NvsStore::new().unwrap();
        assert_eq!(store.get_u64("sec", "nope"), None);
        assert_eq!(store.get_str("sec", "nope"), None);
    }

    #[test]
    fn namespaces_are_isolated() {
        let mut store = NvsStore::new().unwrap();
        store.set_u64("a", "k", 1).unwrap();
        store.set_u64("b", "k", 2).unwrap();
        assert_eq!(store.get_u64("a", "k"), Some(1));
        assert_eq!(store.get_u64("b", "k"), Some(2));
    }

    #[test]
    fn type_confusion_reads_as_none() {
        let mut store = NvsStore::new().unwrap();
        store.set_str("ns", "k", "text").unwrap();
        assert_eq!(store.get_u64("ns", "k"), None);
    }

    #[test]
    fn delete_is_idempotent() {
        let mut store = NvsStore::new().unwrap();
        store.set_u64("ns", "k", 7).unwrap();
        store.delete("ns", "k").unwrap();
        store.delete("ns", "k").unwrap();
        assert_eq!(store.get_u64("ns", "k"), None);
    }
}
