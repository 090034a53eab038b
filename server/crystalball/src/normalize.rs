//! Normalize raw crash rows into the fields bucket queries reference.
//!
//! - `uuid` from the trailing path segment of `uuid_url`
//! - `platform` mirrored from `os_name`
//! - `version` -> `v_v0..v_v3` (+ non-numeric suffix in `v_v4`)
//! - Windows `os_version` -> `osv_v0..`
//! - Windows `app_notes` -> `gpu{0,1}_{vendor,device,subsys}`, `gpu{0,1}_driver_v*`, `gpu_count`
//! - graphics feature markers in `app_notes` -> `app_*` = -1 (`?`), 0 (`-`), 1 (`+`)

use regex::Regex;
use std::sync::LazyLock;

use crate::error::RecordParseError;
use crate::record::{Record, UUID};

pub const WINDOWS_NT: &str = "Windows NT";

const FEATURES: &[(&str, &str)] = &[
  ("D2D", "app_d2d"),
  ("D2D1.1", "app_d2d11"),
  ("DWrite", "app_dwrite"),
  ("D3D9 Layers", "app_d3d9layers"),
  ("D3D10 Layers", "app_d3d10layers"),
  ("D3D11 Layers", "app_d3d11layers"),
  ("GL Layers", "app_gllayers"),
  ("WebGL", "app_webgl"),
  ("EGL", "app_egl"),
  ("GL Context", "app_glcx"),
];

struct GpuPatterns {
  vendor: Regex,
  device: Regex,
  subsys: Regex,
  driver: Regex,
}

impl GpuPatterns {
  fn new(suffix: &str) -> Self {
    let hex = |key: &str| {
      Regex::new(&format!(r"Adapter{}{}: ([0-9a-fx]+),? ?", key, suffix))
        .expect("static adapter pattern")
    };
    Self {
      vendor: hex("VendorID"),
      device: hex("DeviceID"),
      subsys: hex("SubsysID"),
      driver: Regex::new(&format!(r"AdapterDriverVersion{}: ([0-9.]+),? ?", suffix))
        .expect("static driver pattern"),
    }
  }
}

static GPU: LazyLock<[GpuPatterns; 2]> = LazyLock::new(|| [GpuPatterns::new(""), GpuPatterns::new("2")]);

/// "...AdapterDriverVersion2: 0xabcdD2D?" is missing a separator before the features.
static GLUED_FEATURE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"(?i)x([0-9a-f]{4})D").expect("static glued-feature pattern"));

/// Normalize a raw crash row in place.
pub fn normalize(record: &mut Record) -> Result<(), RecordParseError> {
  if !record.contains(UUID) {
    if let Some(url) = record.get_str("uuid_url") {
      let uuid = url.rsplit('/').next().unwrap_or(url).to_string();
      record.insert(UUID, uuid);
    }
  }

  let os_name = record.get_str("os_name").map(str::to_string);
  if let Some(os) = &os_name {
    if !record.contains("platform") {
      record.insert("platform", os.as_str());
    }
  }

  if let Some(version) = record.get_str("version").map(str::to_string) {
    parse_version_into(record, "v", &version);
  }

  let is_windows = os_name.as_deref() == Some(WINDOWS_NT);
  if is_windows {
    if let Some(osv) = record.get_str("os_version").map(str::to_string) {
      parse_version_into(record, "osv", &osv);
    }
  }

  if let Some(notes) = record.get_str("app_notes").map(str::to_string) {
    parse_app_notes_into(record, is_windows, &notes)?;
  }
  Ok(())
}

/// "43.0.1b2" -> `{base}_v0=43, {base}_v1=0, {base}_v2=1, {base}_v4="b2"`.
/// Components that are not integers are left unset.
pub fn parse_version_into(record: &mut Record, base: &str, version: &str) {
  let split_at = version
    .find(|c: char| !(c.is_ascii_digit() || c == '.'))
    .unwrap_or(version.len());
  let (numeric, suffix) = version.split_at(split_at);

  for (i, part) in numeric.split('.').take(4).enumerate() {
    if let Ok(n) = part.parse::<i64>() {
      record.insert(&format!("{}_v{}", base, i), n);
    }
  }
  let suffix = suffix.trim();
  if !suffix.is_empty() {
    record.insert(&format!("{}_v4", base), suffix);
  }
}

fn parse_app_notes_into(
  record: &mut Record,
  is_windows: bool,
  notes: &str,
) -> Result<(), RecordParseError> {
  let mut notes = notes.to_string();

  if is_windows {
    let mut gpus = 0;
    if take_gpu_info(record, 0, &mut notes)? {
      gpus += 1;
    }
    if notes.contains("Has dual GPUs") {
      notes = GLUED_FEATURE.replace(&notes, "x$1 | D").into_owned();
      if take_gpu_info(record, 1, &mut notes)? {
        gpus += 1;
      }
    }
    if gpus > 0 {
      record.insert("gpu_count", gpus as i64);
    }
  }

  for (marker, field) in FEATURES {
    let mut state = None;
    for (flag, value) in [('?', -1_i64), ('-', 0), ('+', 1)] {
      if notes.contains(&format!("{}{}", marker, flag)) {
        state = Some(value);
      }
    }
    if let Some(v) = state {
      record.insert(field, v);
    }
  }
  Ok(())
}

/// Pull adapter ids for GPU `gpu` out of `notes`, removing each match.
/// Returns whether a vendor id was found.
fn take_gpu_info(record: &mut Record, gpu: usize, notes: &mut String) -> Result<bool, RecordParseError> {
  let patterns = &GPU[gpu];
  let mut found_vendor = false;

  for (re, key) in [
    (&patterns.vendor, "vendor"),
    (&patterns.device, "device"),
    (&patterns.subsys, "subsys"),
  ] {
    if let Some(raw) = take(re, notes) {
      let field = format!("gpu{}_{}", gpu, key);
      let value = parse_hex(&raw).ok_or_else(|| RecordParseError::new(&field, format!("bad hex id {:?}", raw)))?;
      record.insert(&field, value);
      found_vendor |= key == "vendor";
    }
  }

  if let Some(driver) = take(&patterns.driver, notes) {
    parse_version_into(record, &format!("gpu{}_driver", gpu), &driver);
  }
  Ok(found_vendor)
}

fn take(re: &Regex, notes: &mut String) -> Option<String> {
  let caps = re.captures(notes)?;
  let whole = caps.get(0)?.range();
  let value = caps.get(1)?.as_str().to_string();
  notes.replace_range(whole, "");
  Some(value)
}

fn parse_hex(raw: &str) -> Option<i64> {
  let digits = raw.strip_prefix("0x").unwrap_or(raw);
  i64::from_str_radix(digits, 16).ok()
}
