//! # Dota 2 Companion Core
//!
//! Offline-resilient data layer for a Dota 2 companion app, designed for FFI
//! integration with Flutter and other cross-platform front ends.
//!
//! ## Features
//!
//! - **Two storage tiers**: an LMDB structured store with secondary indexes,
//!   mirrored into a flat JSON key/value store that takes over when LMDB
//!   cannot be opened
//! - **TTL cache**: freshness metadata per upstream resource (heroes 1h,
//!   players 30m, matches 24h, everything else 15m)
//! - **Retry queue**: requests that failed for connectivity reasons are
//!   replayed on reconnect and every 30 seconds, up to 3 times
//! - **Resilient reads**: network, then cache, then clearly tagged demo data
//! - **Safe error handling**: no `unwrap()` calls in production code
//!
//! ## Quick Start
//!
//! ```no_run
//! use dota_companion_core::{create_companion, login_profile, free_response};
//! use std::ffi::CString;
//!
//! let config = CString::new(r#"{"data_dir":"companion_data"}"#).unwrap();
//! let handle = create_companion(config.as_ptr());
//!
//! let steam_id = CString::new("76561198047553230").unwrap();
//! let name = CString::new("testuser").unwrap();
//! let response = login_profile(handle, steam_id.as_ptr(), name.as_ptr());
//! free_response(response as *mut _);
//! ```
//!
//! ## FFI Functions
//!
//! Every function except the two constructors and [`free_response`] returns a
//! JSON-encoded [`AppResponse`] that must be released with [`free_response`].
//!
//! - [`create_companion`], [`create_companion_from_file`], [`close_companion`] -
//!   Handle lifecycle
//! - [`login_profile`], [`get_profile`], [`update_profile`] - Profile
//! - [`add_favorite_hero`], [`remove_favorite_hero`], [`add_favorite_item`],
//!   [`remove_favorite_item`] - Favorites
//! - [`save_custom_build`], [`get_custom_builds`], [`delete_custom_build`] - Builds
//! - [`cache_match`], [`get_cached_matches`] - Match cache
//! - [`export_data`], [`import_data`] - Snapshots
//! - [`get_heroes`], [`search_players`] - Upstream reads
//! - [`set_online`], [`health_check`] - Connectivity and health
//!
//! Rust callers can skip the C ABI and use [`CompanionBackend`] directly.

pub mod backend;
pub mod cache_manager;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod flat_store;
pub mod local_db_model;
pub mod local_db_state;
pub mod network_model;
pub mod persistence;
pub mod placeholder;
pub mod resilient_api;
pub mod retry_queue;
pub mod upstream;
mod app_response;
#[cfg(test)]
mod test;

pub use crate::app_response::AppResponse;
pub use crate::backend::{CompanionBackend, HealthReport, HealthStatus};
pub use crate::config::CompanionConfig;
pub use crate::connectivity::Connectivity;
pub use crate::error::{CompanionError, Result};

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::Path;

use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::runtime::Runtime;

use crate::local_db_model::{
    CachedMatch, CustomBuild, ExportSnapshot, FavoriteHero, FavoriteItem, ProfileUpdate,
};

/// A [`CompanionBackend`] together with the runtime that drives it.
///
/// Created by [`create_companion`] and released by [`close_companion`].
pub struct CompanionHandle {
    runtime: Runtime,
    backend: CompanionBackend,
}

impl CompanionHandle {
    pub fn new(config: CompanionConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("dota-companion")
            .enable_all()
            .build()?;
        let backend = CompanionBackend::from_config(config)?;

        runtime.block_on(async {
            backend.initialize().await?;
            backend.start_background_tasks().await
        })?;

        Ok(Self { runtime, backend })
    }

    pub fn backend(&self) -> &CompanionBackend {
        &self.backend
    }

    fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

/// Creates a companion instance from a JSON configuration.
///
/// # Parameters
///
/// * `config_json` - JSON object with any [`CompanionConfig`] fields, or null.
///   Missing fields take their defaults. Environment overrides
///   (`DOTA_COMPANION_*`) are applied on top in both cases.
///
/// # Returns
///
/// A pointer to the [`CompanionHandle`], or null on failure.
///
/// # Safety
///
/// `config_json` must be null or a valid NUL-terminated string.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn create_companion(config_json: *const c_char) -> *mut CompanionHandle {
    let loaded = if config_json.is_null() {
        CompanionConfig::load(None)
    } else {
        let raw = match unsafe { CStr::from_ptr(config_json).to_str() } {
            Ok(s) => s,
            Err(e) => {
                warn!("Invalid UTF-8 in companion config: {e}");
                return std::ptr::null_mut();
            }
        };
        CompanionConfig::from_json_str(raw)
    };

    match loaded {
        Ok(config) => open_handle(config),
        Err(e) => {
            warn!("Rejected companion config: {e}");
            std::ptr::null_mut()
        }
    }
}

/// Creates a companion instance from a TOML configuration file.
///
/// # Parameters
///
/// * `path` - Path of a TOML file with any [`CompanionConfig`] fields.
///   Environment overrides (`DOTA_COMPANION_*`) are applied on top.
///
/// # Returns
///
/// A pointer to the [`CompanionHandle`], or null when the file cannot be
/// read or parsed, the configuration is invalid, or storage cannot open.
///
/// # Safety
///
/// `path` must be a valid NUL-terminated string.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn create_companion_from_file(path: *const c_char) -> *mut CompanionHandle {
    if path.is_null() {
        warn!("Null path passed to create_companion_from_file");
        return std::ptr::null_mut();
    }
    let path = match unsafe { CStr::from_ptr(path).to_str() } {
        Ok(s) => s,
        Err(e) => {
            warn!("Invalid UTF-8 in config path: {e}");
            return std::ptr::null_mut();
        }
    };

    match CompanionConfig::load(Some(Path::new(path))) {
        Ok(config) => open_handle(config),
        Err(e) => {
            warn!("Rejected companion config at {path}: {e}");
            std::ptr::null_mut()
        }
    }
}

fn open_handle(config: CompanionConfig) -> *mut CompanionHandle {
    info!("Creating companion in {}", config.data_dir.display());
    match CompanionHandle::new(config) {
        Ok(handle) => Box::into_raw(Box::new(handle)),
        Err(e) => {
            warn!("Failed to create companion: {e}");
            std::ptr::null_mut()
        }
    }
}

/// Stops background work, flushes storage and frees the handle.
///
/// # Returns
///
/// A JSON-formatted C string with the operation result.
///
/// # Safety
///
/// `handle` must come from [`create_companion`] and must not be used afterwards.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn close_companion(handle: *mut CompanionHandle) -> *const c_char {
    if handle.is_null() {
        let error = AppResponse::BadRequest("Null handle passed to close_companion".to_string());
        return response_to_c_string(&error);
    }

    let handle = unsafe { Box::from_raw(handle) };
    handle.backend.shutdown();
    drop(handle);
    response_to_c_string(&AppResponse::success("Companion closed"))
}

/// Releases a string returned by any other function of this library.
///
/// # Safety
///
/// `ptr` must be null or a pointer previously returned by this library.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn free_response(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(unsafe { CString::from_raw(ptr) });
    }
}

/// Returns the resident profile, or `NotFound` when nobody has logged in.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_profile(handle: *mut CompanionHandle) -> *const c_char {
    let handle = match handle_ref(handle, "get_profile") {
        Ok(h) => h,
        Err(err) => return err,
    };

    match handle.block_on(handle.backend.get_profile(None)) {
        Ok(Some(profile)) => respond(Ok(profile)),
        Ok(None) => response_to_c_string(&AppResponse::NotFound("No profile stored".to_string())),
        Err(e) => respond::<()>(Err(e)),
    }
}

/// Logs in as `steam_id`, creating the profile on first login.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn login_profile(
    handle: *mut CompanionHandle,
    steam_id: *const c_char,
    persona_name: *const c_char,
) -> *const c_char {
    let handle = match handle_ref(handle, "login_profile") {
        Ok(h) => h,
        Err(err) => return err,
    };
    let steam_id = match c_ptr_to_string(steam_id, "steam_id") {
        Ok(s) => s,
        Err(err) => return err,
    };
    let persona_name = match c_ptr_to_string(persona_name, "persona_name") {
        Ok(s) => s,
        Err(err) => return err,
    };

    respond(handle.block_on(handle.backend.get_or_create_profile(&steam_id, &persona_name)))
}

/// Shallow-merges a [`ProfileUpdate`] JSON object into the resident profile.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn update_profile(
    handle: *mut CompanionHandle,
    json_ptr: *const c_char,
) -> *const c_char {
    let handle = match handle_ref(handle, "update_profile") {
        Ok(h) => h,
        Err(err) => return err,
    };
    let update: ProfileUpdate = match parse_json(json_ptr, "profile update") {
        Ok(u) => u,
        Err(err) => return err,
    };

    respond(handle.block_on(handle.backend.update_profile(update)))
}

/// Adds a hero to the resident profile's favorites.
///
/// At most ten heroes are kept; the oldest one is evicted to make room.
///
/// # Parameters
///
/// * `handle` - Pointer to the companion instance
/// * `json_ptr` - Null-terminated JSON [`FavoriteHero`], e.g. `{"id":1,"name":"Anti-Mage"}`
///
/// # Returns
///
/// The updated profile in an `Ok` envelope. The returned string must be
/// freed with [`free_response`].
///
/// # Safety
///
/// Both pointers must be valid; `json_ptr` must be NUL-terminated.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn add_favorite_hero(
    handle: *mut CompanionHandle,
    json_ptr: *const c_char,
) -> *const c_char {
    let handle = match handle_ref(handle, "add_favorite_hero") {
        Ok(h) => h,
        Err(err) => return err,
    };
    let hero: FavoriteHero = match parse_json(json_ptr, "favorite hero") {
        Ok(h) => h,
        Err(err) => return err,
    };

    respond(handle.block_on(handle.backend.add_favorite_hero(hero)))
}

/// Removes a hero from the resident profile's favorites.
///
/// # Returns
///
/// `Ok` when the hero was removed, `NotFound` when it was not a favorite.
///
/// # Safety
///
/// `handle` must come from [`create_companion`].
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn remove_favorite_hero(
    handle: *mut CompanionHandle,
    hero_id: u32,
) -> *const c_char {
    let handle = match handle_ref(handle, "remove_favorite_hero") {
        Ok(h) => h,
        Err(err) => return err,
    };

    match handle.block_on(handle.backend.remove_favorite_hero(hero_id)) {
        Ok(true) => response_to_c_string(&AppResponse::success(format!("Hero {hero_id} removed"))),
        Ok(false) => {
            let missing = AppResponse::NotFound(format!("Hero {hero_id} is not a favorite"));
            response_to_c_string(&missing)
        }
        Err(e) => respond::<()>(Err(e)),
    }
}

/// Adds an item to the resident profile's favorites (at most twenty).
///
/// # Parameters
///
/// * `handle` - Pointer to the companion instance
/// * `json_ptr` - Null-terminated JSON [`FavoriteItem`]
///
/// # Returns
///
/// The updated profile in an `Ok` envelope.
///
/// # Safety
///
/// Both pointers must be valid; `json_ptr` must be NUL-terminated.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn add_favorite_item(
    handle: *mut CompanionHandle,
    json_ptr: *const c_char,
) -> *const c_char {
    let handle = match handle_ref(handle, "add_favorite_item") {
        Ok(h) => h,
        Err(err) => return err,
    };
    let item: FavoriteItem = match parse_json(json_ptr, "favorite item") {
        Ok(i) => i,
        Err(err) => return err,
    };

    respond(handle.block_on(handle.backend.add_favorite_item(item)))
}

/// Removes an item from the resident profile's favorites.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn remove_favorite_item(
    handle: *mut CompanionHandle,
    item_id: u32,
) -> *const c_char {
    let handle = match handle_ref(handle, "remove_favorite_item") {
        Ok(h) => h,
        Err(err) => return err,
    };

    match handle.block_on(handle.backend.remove_favorite_item(item_id)) {
        Ok(true) => response_to_c_string(&AppResponse::success(format!("Item {item_id} removed"))),
        Ok(false) => {
            let missing = AppResponse::NotFound(format!("Item {item_id} is not a favorite"));
            response_to_c_string(&missing)
        }
        Err(e) => respond::<()>(Err(e)),
    }
}

/// Saves a build; an empty or missing `id` creates a new one.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn save_custom_build(
    handle: *mut CompanionHandle,
    json_ptr: *const c_char,
) -> *const c_char {
    let handle = match handle_ref(handle, "save_custom_build") {
        Ok(h) => h,
        Err(err) => return err,
    };
    let build: CustomBuild = match parse_json(json_ptr, "custom build") {
        Ok(b) => b,
        Err(err) => return err,
    };

    respond(handle.block_on(handle.backend.save_custom_build(build)))
}

/// Builds of the resident profile; a negative `hero_id` returns all of them.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_custom_builds(handle: *mut CompanionHandle, hero_id: i64) -> *const c_char {
    let handle = match handle_ref(handle, "get_custom_builds") {
        Ok(h) => h,
        Err(err) => return err,
    };
    let hero_filter = u32::try_from(hero_id).ok();

    respond(handle.block_on(handle.backend.get_custom_builds(hero_filter)))
}

#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn delete_custom_build(
    handle: *mut CompanionHandle,
    build_id: *const c_char,
) -> *const c_char {
    let handle = match handle_ref(handle, "delete_custom_build") {
        Ok(h) => h,
        Err(err) => return err,
    };
    let build_id = match c_ptr_to_string(build_id, "build_id") {
        Ok(id) => id,
        Err(err) => return err,
    };

    match handle.block_on(handle.backend.delete_custom_build(&build_id)) {
        Ok(true) => {
            response_to_c_string(&AppResponse::success(format!("Build {build_id} deleted")))
        }
        Ok(false) => {
            let missing = AppResponse::NotFound(format!("No build with id: {build_id}"));
            response_to_c_string(&missing)
        }
        Err(e) => respond::<()>(Err(e)),
    }
}

/// Stores a match in the resident profile's match cache.
///
/// The cache keeps the 50 newest matches by `cachedAt`; a match with the
/// same id replaces the earlier entry.
///
/// # Parameters
///
/// * `handle` - Pointer to the companion instance
/// * `json_ptr` - Null-terminated JSON [`CachedMatch`]
///
/// # Safety
///
/// Both pointers must be valid; `json_ptr` must be NUL-terminated.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn cache_match(
    handle: *mut CompanionHandle,
    json_ptr: *const c_char,
) -> *const c_char {
    let handle = match handle_ref(handle, "cache_match") {
        Ok(h) => h,
        Err(err) => return err,
    };
    let entry: CachedMatch = match parse_json(json_ptr, "cached match") {
        Ok(m) => m,
        Err(err) => return err,
    };

    match handle.block_on(handle.backend.cache_match(entry)) {
        Ok(()) => response_to_c_string(&AppResponse::success("Match cached")),
        Err(e) => respond::<()>(Err(e)),
    }
}

/// Up to `limit` cached matches, newest first.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_cached_matches(handle: *mut CompanionHandle, limit: u32) -> *const c_char {
    let handle = match handle_ref(handle, "get_cached_matches") {
        Ok(h) => h,
        Err(err) => return err,
    };

    respond(handle.block_on(handle.backend.get_cached_matches(limit as usize)))
}

/// Exports the resident profile and everything keyed to it.
///
/// # Returns
///
/// An [`ExportSnapshot`] (format version `1.0`) in an `Ok` envelope, ready to
/// be passed back to [`import_data`].
///
/// # Safety
///
/// `handle` must come from [`create_companion`].
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn export_data(handle: *mut CompanionHandle) -> *const c_char {
    let handle = match handle_ref(handle, "export_data") {
        Ok(h) => h,
        Err(err) => return err,
    };

    respond(handle.block_on(handle.backend.export_data()))
}

/// Loads a snapshot produced by [`export_data`].
///
/// Entries are upserted; nothing already stored is removed. Snapshots with
/// another major version are rejected with `ValidationError`.
///
/// # Parameters
///
/// * `handle` - Pointer to the companion instance
/// * `json_ptr` - Null-terminated JSON [`ExportSnapshot`]
///
/// # Safety
///
/// Both pointers must be valid; `json_ptr` must be NUL-terminated.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn import_data(
    handle: *mut CompanionHandle,
    json_ptr: *const c_char,
) -> *const c_char {
    let handle = match handle_ref(handle, "import_data") {
        Ok(h) => h,
        Err(err) => return err,
    };
    let snapshot: ExportSnapshot = match parse_json(json_ptr, "export snapshot") {
        Ok(s) => s,
        Err(err) => return err,
    };

    match handle.block_on(handle.backend.import_data(&snapshot)) {
        Ok(()) => response_to_c_string(&AppResponse::success("Data imported")),
        Err(e) => respond::<()>(Err(e)),
    }
}

/// Reports storage and network health.
///
/// # Returns
///
/// Always an `Ok` envelope holding a [`HealthReport`] whose `status` is
/// `healthy`, `degraded` (flat store only, or upstream unreachable) or `error`.
///
/// # Safety
///
/// `handle` must come from [`create_companion`].
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn health_check(handle: *mut CompanionHandle) -> *const c_char {
    let handle = match handle_ref(handle, "health_check") {
        Ok(h) => h,
        Err(err) => return err,
    };

    respond(Ok(handle.block_on(handle.backend.health_check())))
}

/// Hero list with provenance flags (`cached`, `isDemo`, `stale`).
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_heroes(handle: *mut CompanionHandle) -> *const c_char {
    let handle = match handle_ref(handle, "get_heroes") {
        Ok(h) => h,
        Err(err) => return err,
    };

    respond(handle.block_on(handle.backend.get_heroes()))
}

#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn search_players(
    handle: *mut CompanionHandle,
    query: *const c_char,
) -> *const c_char {
    let handle = match handle_ref(handle, "search_players") {
        Ok(h) => h,
        Err(err) => return err,
    };
    let query = match c_ptr_to_string(query, "query") {
        Ok(q) => q,
        Err(err) => return err,
    };

    respond(handle.block_on(handle.backend.search_players(&query)))
}

/// Reports a connectivity change from the host's network monitor.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn set_online(handle: *mut CompanionHandle, online: bool) -> *const c_char {
    let handle = match handle_ref(handle, "set_online") {
        Ok(h) => h,
        Err(err) => return err,
    };

    handle.backend.connectivity().set_online(online);
    response_to_c_string(&AppResponse::success(if online { "online" } else { "offline" }))
}

fn handle_ref<'a>(
    handle: *mut CompanionHandle,
    op: &str,
) -> std::result::Result<&'a CompanionHandle, *const c_char> {
    match unsafe { handle.as_ref() } {
        Some(h) => Ok(h),
        None => {
            let error = AppResponse::BadRequest(format!("Null handle passed to {op}"));
            Err(response_to_c_string(&error))
        }
    }
}

fn parse_json<T: DeserializeOwned>(
    ptr: *const c_char,
    field_name: &str,
) -> std::result::Result<T, *const c_char> {
    let json = c_ptr_to_string(ptr, field_name)?;
    serde_json::from_str(&json).map_err(|e| {
        let error = AppResponse::SerializationError(format!("Invalid {field_name} JSON: {e}"));
        response_to_c_string(&error)
    })
}

/// Serializes `Ok` values into an `Ok` envelope and maps errors to their category.
fn respond<T: Serialize>(result: Result<T>) -> *const c_char {
    let response = match result {
        Ok(value) => match serde_json::to_string(&value) {
            Ok(json) => AppResponse::Ok(json),
            Err(e) => AppResponse::from(e),
        },
        Err(e) => AppResponse::from(e),
    };
    response_to_c_string(&response)
}

/// Converts an [`AppResponse`] to a C string the caller releases with [`free_response`].
///
/// Returns a null pointer if serialization or C string creation fails.
fn response_to_c_string(response: &AppResponse) -> *const c_char {
    let json = match serde_json::to_string(response) {
        Ok(j) => j,
        Err(e) => {
            warn!("Error serializing response: {e}");
            return std::ptr::null();
        }
    };

    match CString::new(json) {
        Ok(c_str) => c_str.into_raw(),
        Err(e) => {
            warn!("Error creating CString: {e}");
            std::ptr::null()
        }
    }
}

/// Converts a C string pointer to a Rust String.
///
/// # Returns
///
/// * `Ok(String)` - If conversion was successful
/// * `Err(*const c_char)` - Error envelope for a null pointer or invalid UTF-8
fn c_ptr_to_string(
    ptr: *const c_char,
    field_name: &str,
) -> std::result::Result<String, *const c_char> {
    if ptr.is_null() {
        let error = AppResponse::BadRequest(format!("Null {field_name} pointer"));
        return Err(response_to_c_string(&error));
    }

    match unsafe { CStr::from_ptr(ptr).to_str() } {
        Ok(s) => Ok(s.to_string()),
        Err(e) => {
            let error = AppResponse::BadRequest(format!("Invalid UTF-8 in {field_name}: {e}"));
            Err(response_to_c_string(&error))
        }
    }
}
