//! Named compile-time constants.
//!
//! An append-only vector of [`Value`]s with a case-insensitive name→index
//! map. Indices are stable for the lifetime of the store, so the parser can
//! bake them into `ConstRef` expressions and the emitted program can fetch
//! them back with `constants_get(index)`.
//!
//! Names are normalized to lower case, so `PI`, `pi` and `Pi` all resolve to
//! the same entry.

use crate::value::Value;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

#[derive(Debug, Clone, Default)]
pub struct ConstantsStore {
    values: Vec<Value>,
    by_name: HashMap<String, usize>,
}

impl ConstantsStore {
    pub fn new() -> Self {
        ConstantsStore::default()
    }

    /// A store pre-loaded with the predefined constant set.
    pub fn with_predefined() -> Self {
        let mut store = ConstantsStore::new();
        store.add_predefined();
        store
    }

    fn normalize(name: &str) -> String {
        name.to_lowercase()
    }

    /// Define a new constant. Redefinition is an error — constants are never
    /// shadowed.
    pub fn define(&mut self, name: &str, value: Value) -> Result<usize, String> {
        let key = Self::normalize(name);
        if self.by_name.contains_key(&key) {
            return Err(format!("Constant '{}' is already defined", name));
        }
        let index = self.values.len();
        self.values.push(value);
        self.by_name.insert(key, index);
        Ok(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(&Self::normalize(name)).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_int(&self, index: usize) -> i64 {
        self.values.get(index).map(Value::as_int).unwrap_or(0)
    }

    pub fn get_double(&self, index: usize) -> f64 {
        self.values.get(index).map(Value::as_double).unwrap_or(0.0)
    }

    pub fn get_string(&self, index: usize) -> String {
        self.values
            .get(index)
            .map(Value::as_str)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Snapshot of all values in index order, for handing to the runtime.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    fn def(&mut self, name: &str, value: Value) {
        // Predefined names are inserted exactly once during construction.
        let _ = self.define(name, value);
    }

    fn def_i(&mut self, name: &str, value: i64) {
        self.def(name, Value::Int(value));
    }

    fn def_d(&mut self, name: &str, value: f64) {
        self.def(name, Value::Double(value));
    }

    /// The predefined constant set: mathematical constants, booleans, display
    /// modes, color palettes, waveform/filter enums, gradient and pattern
    /// modes.
    pub fn add_predefined(&mut self) {
        // Mathematical constants
        self.def_d("pi", std::f64::consts::PI);
        self.def_d("e", std::f64::consts::E);
        self.def_d("sqrt2", std::f64::consts::SQRT_2);
        self.def_d("sqrt3", 1.732_050_807_568_877_2);
        self.def_d("golden_ratio", 1.618_033_988_749_894_8);

        // Boolean constants
        self.def_i("true", 1);
        self.def_i("false", 0);

        // Display modes
        self.def_i("text", 0);
        self.def_i("lores", 1);
        self.def_i("midres", 2);
        self.def_i("hires", 3);
        self.def_i("ultrares", 4);

        // 24-bit RGB colors
        self.def_i("black", 0x000000);
        self.def_i("white", 0xFFFFFF);
        self.def_i("red", 0xFF0000);
        self.def_i("green", 0x00FF00);
        self.def_i("blue", 0x0000FF);
        self.def_i("yellow", 0xFFFF00);
        self.def_i("cyan", 0x00FFFF);
        self.def_i("magenta", 0xFF00FF);

        // Opaque RGBA variants (0xRRGGBBAA)
        self.def_i("solid_black", 0x000000FF);
        self.def_i("solid_white", 0xFFFFFFFFu32 as i64);
        self.def_i("solid_red", 0xFF0000FF_u32 as i64);
        self.def_i("solid_green", 0x00FF00FF);
        self.def_i("solid_blue", 0x0000FFFF);
        self.def_i("solid_yellow", 0xFFFF00FF_u32 as i64);
        self.def_i("solid_cyan", 0x00FFFFFF);
        self.def_i("solid_magenta", 0xFF00FFFF_u32 as i64);
        self.def_i("solid_gray", 0x808080FF_u32 as i64);
        self.def_i("solid_grey", 0x808080FF_u32 as i64);
        self.def_i("clear_black", 0x00000000);

        // C64 palette (0xAARRGGBB), both spellings resolve identically
        // through lower-casing so only one set is stored.
        let c64: [u32; 16] = [
            0xFF000000, 0xFFFFFFFF, 0xFF880000, 0xFFAAFFEE, 0xFFCC44CC, 0xFF00CC55, 0xFF0000AA,
            0xFFEEEE77, 0xFFDD8855, 0xFF664400, 0xFFFF7777, 0xFF333333, 0xFF777777, 0xFFAAFF66,
            0xFF0088FF, 0xFFBBBBBB,
        ];
        for (i, argb) in c64.iter().enumerate() {
            self.def_i(&format!("colour_{}", i), *argb as i64);
        }

        // Waveform types
        for (i, name) in [
            "wave_silence",
            "wave_sine",
            "wave_square",
            "wave_sawtooth",
            "wave_triangle",
            "wave_noise",
            "wave_pulse",
            "wave_physical",
        ]
        .iter()
        .enumerate()
        {
            self.def_i(name, i as i64);
        }

        // Filter types
        for (i, name) in [
            "filter_none",
            "filter_lowpass",
            "filter_highpass",
            "filter_bandpass",
            "filter_notch",
        ]
        .iter()
        .enumerate()
        {
            self.def_i(name, i as i64);
        }

        // Rectangle gradient modes
        for (i, name) in [
            "st_gradient_solid",
            "st_gradient_horizontal",
            "st_gradient_vertical",
            "st_gradient_diagonal_tl_br",
            "st_gradient_diagonal_tr_bl",
            "st_gradient_radial",
            "st_gradient_four_corner",
            "st_gradient_three_point",
        ]
        .iter()
        .enumerate()
        {
            self.def_i(name, i as i64);
        }

        // Rectangle procedural pattern modes (offset block at 100)
        for (i, name) in [
            "st_pattern_outline",
            "st_pattern_dashed_outline",
            "st_pattern_horizontal_stripes",
            "st_pattern_vertical_stripes",
        ]
        .iter()
        .enumerate()
        {
            self.def_i(name, 100 + i as i64);
        }
    }
}

static GLOBAL: OnceLock<RwLock<GlobalConstants>> = OnceLock::new();

#[derive(Debug)]
struct GlobalConstants {
    store: ConstantsStore,
    initialized: bool,
}

fn global() -> &'static RwLock<GlobalConstants> {
    GLOBAL.get_or_init(|| {
        RwLock::new(GlobalConstants {
            store: ConstantsStore::with_predefined(),
            initialized: false,
        })
    })
}

/// Add a process-wide constant (plugin initialization only).
pub fn define_global(name: &str, value: Value) -> Result<usize, String> {
    let mut g = global().write().map_err(|_| "constants lock poisoned".to_string())?;
    if g.initialized {
        return Err(format!(
            "Cannot define constant '{}': the constants store is sealed",
            name
        ));
    }
    g.store.define(name, value)
}

/// Seal the global constants store.
pub fn mark_initialized() {
    if let Ok(mut g) = global().write() {
        g.initialized = true;
    }
}

/// Clone the global store for one compilation. User `CONST` declarations
/// append to the clone, never to the shared set.
pub fn snapshot() -> ConstantsStore {
    global()
        .read()
        .map(|g| g.store.clone())
        .unwrap_or_else(|_| ConstantsStore::with_predefined())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predefined_lookup_any_case() {
        let store = ConstantsStore::with_predefined();
        let a = store.index_of("PI").unwrap();
        let b = store.index_of("pi").unwrap();
        let c = store.index_of("Pi").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert!((store.get_double(a) - std::f64::consts::PI).abs() < 1e-12);
    }

    #[test]
    fn booleans_are_integers() {
        let store = ConstantsStore::with_predefined();
        assert_eq!(store.get_int(store.index_of("true").unwrap()), 1);
        assert_eq!(store.get_int(store.index_of("false").unwrap()), 0);
    }

    #[test]
    fn indices_are_stable_and_monotonic() {
        let mut store = ConstantsStore::new();
        let a = store.define("alpha", Value::Int(1)).unwrap();
        let b = store.define("beta", Value::Int(2)).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(store.get(a), Some(&Value::Int(1)));
    }

    #[test]
    fn redefinition_is_an_error() {
        let mut store = ConstantsStore::new();
        store.define("k", Value::Int(1)).unwrap();
        assert!(store.define("K", Value::Int(2)).is_err());
    }

    #[test]
    fn coercing_getters() {
        let mut store = ConstantsStore::new();
        let i = store.define("n", Value::Double(2.5)).unwrap();
        assert_eq!(store.get_int(i), 2);
        assert_eq!(store.get_string(i), "2.5");
    }
}
