//! JSON wire format for model snapshots.
//!
//! The envelope carries a format version and export timestamp next to the
//! snapshot itself. A quantized export stores each weight matrix as integer
//! codes plus scales and leaves an empty placeholder in the snapshot; import
//! dequantizes those back in. Import checks the version, then runs full
//! snapshot validation so a malformed file fails at load rather than
//! mid-request.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::model::{ModelSnapshot, QuantizedSnapshot};
use crate::quantize::QuantizedTensor;
use crate::time::{now_unix_secs, unix_to_iso8601};

pub const CURRENT_VERSION: &str = "1.0";

#[derive(Serialize, Deserialize, Debug)]
pub struct WireSnapshot {
    pub version: String,
    #[serde(default)]
    pub timestamp: String,
    pub snapshot: ModelSnapshot,
    /// Integer weights in `ModelSnapshot::weights_mut` order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantized: Option<Vec<QuantizedTensor>>,
}

pub fn export_snapshot(snapshot: &ModelSnapshot) -> Result<String> {
    let wire = WireSnapshot {
        version: CURRENT_VERSION.to_string(),
        timestamp: unix_to_iso8601(now_unix_secs()),
        snapshot: snapshot.clone(),
        quantized: None,
    };
    Ok(serde_json::to_string(&wire)?)
}

pub fn export_quantized(quantized: &QuantizedSnapshot) -> Result<String> {
    let wire = WireSnapshot {
        version: CURRENT_VERSION.to_string(),
        timestamp: unix_to_iso8601(now_unix_secs()),
        snapshot: quantized.skeleton.clone(),
        quantized: Some(quantized.tensors.clone()),
    };
    Ok(serde_json::to_string(&wire)?)
}

pub fn import_snapshot(json: &str) -> Result<ModelSnapshot> {
    let wire: WireSnapshot = serde_json::from_str(json)?;
    if wire.version != CURRENT_VERSION {
        return Err(CoreError::Serde(format!(
            "unsupported snapshot version {:?}, expected {CURRENT_VERSION:?}",
            wire.version
        )));
    }
    match wire.quantized {
        Some(tensors) => QuantizedSnapshot {
            skeleton: wire.snapshot,
            tensors,
        }
        .dequantize(),
        None => {
            wire.snapshot.validate()?;
            Ok(wire.snapshot)
        }
    }
}
