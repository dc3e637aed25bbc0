use std::{collections::HashMap, fs, path::{Path, PathBuf}};

use serde::Serialize;
use tracing::debug;

use crate::{config::{EntryValue, TuningEntry}, params::{ParamKind, TuningParameter, Value}, TuneError};

#[derive(Serialize)]
struct ResultFile {
    tuning: Vec<TuningEntry>,
}

enum Slot {
    Scalar(Value),
    Array(Vec<(usize, Value)>),
}

/// Regroups array elements under their base name, in order of first appearance.
pub fn group_parameters(params: &[TuningParameter]) -> Result<Vec<TuningEntry>, TuneError> {
    let mut slots: Vec<(String, Slot)> = Vec::new();
    let mut arrays: HashMap<&str, usize> = HashMap::new();

    for param in params {
        match &param.kind {
            ParamKind::Scalar { name } => slots.push((name.clone(), Slot::Scalar(param.value))),
            ParamKind::ArrayElement { base_name, index } => match arrays.get(base_name.as_str()) {
                Some(&at) => {
                    if let Slot::Array(items) = &mut slots[at].1 {
                        items.push((*index, param.value));
                    }
                }
                None => {
                    arrays.insert(base_name, slots.len());
                    slots.push((base_name.clone(), Slot::Array(vec![(*index, param.value)])));
                }
            },
        }
    }

    slots
        .into_iter()
        .map(|(name, slot)| match slot {
            Slot::Scalar(value) => Ok(TuningEntry { name, value: EntryValue::Scalar(value) }),
            Slot::Array(mut items) => {
                items.sort_by_key(|&(index, _)| index);
                for (expected, &(index, _)) in items.iter().enumerate() {
                    if index != expected {
                        return Err(TuneError::ArrayGap { name, index: expected });
                    }
                }
                let values = items.into_iter().map(|(_, value)| value).collect();
                Ok(TuningEntry { name, value: EntryValue::List(values) })
            }
        })
        .collect()
}

pub fn to_toml(params: &[TuningParameter]) -> Result<String, TuneError> {
    let file = ResultFile { tuning: group_parameters(params)? };
    Ok(toml::to_string_pretty(&file)?)
}

/// Writes the result next to `path` first and renames it into place.
pub fn write_results(path: &Path, params: &[TuningParameter]) -> Result<(), TuneError> {
    let text = to_toml(params)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, text).map_err(|source| TuneError::Write { path: tmp.clone(), source })?;
    fs::rename(&tmp, path).map_err(|source| TuneError::Write { path: path.to_path_buf(), source })?;
    debug!(path = %path.display(), "Wrote tuning result");
    Ok(())
}
