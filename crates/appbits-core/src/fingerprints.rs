use std::collections::HashSet;

use crate::error::PackagingError;

/// Mode given to cached files when the client doesn't send one.
pub const DEFAULT_FILE_MODE: u32 = 0o744;

/// Cached files must at least be readable and writable by their owner.
const MINIMUM_FILE_MODE: u32 = 0o600;

/// A client's claim that a file with this content already exists in the
/// app bits cache, and where it belongs in the package.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Fingerprint {
    #[serde(rename = "fn")]
    pub destination_path: String,
    #[serde(rename = "sha1")]
    pub content_hash: String,
    #[serde(serialize_with = "serialize_mode")]
    pub mode: u32,
}

/// A validated list of fingerprints, in the order the client sent them.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(transparent)]
pub struct FingerprintSet {
    fingerprints: Vec<Fingerprint>,
}

impl FingerprintSet {
    /// Validate a raw fingerprint payload, normally a JSON array of
    /// `{"fn": .., "sha1": .., "mode": ..}` objects. `null` is treated as an
    /// empty list.
    pub fn parse(raw: &serde_json::Value) -> Result<Self, PackagingError> {
        let entries = match raw {
            serde_json::Value::Null => return Ok(Self::default()),
            serde_json::Value::Array(entries) => entries,
            _ => return Err(PackagingError::malformed("fingerprints must be an array")),
        };

        let mut fingerprints = Vec::with_capacity(entries.len());
        let mut seen_paths = HashSet::new();
        for (index, entry) in entries.iter().enumerate() {
            let fingerprint = parse_fingerprint(entry)
                .map_err(|reason| PackagingError::malformed(format!("entry {index}: {reason}")))?;

            if !seen_paths.insert(fingerprint.destination_path.clone()) {
                return Err(PackagingError::malformed(format!(
                    "entry {index}: duplicate file path {:?}",
                    fingerprint.destination_path
                )));
            }

            fingerprints.push(fingerprint);
        }

        Ok(Self { fingerprints })
    }

    pub fn from_json_str(json: &str) -> Result<Self, PackagingError> {
        let raw: serde_json::Value = serde_json::from_str(json)
            .map_err(|error| PackagingError::malformed(format!("invalid JSON: {error}")))?;
        Self::parse(&raw)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("failed to serialize fingerprints")
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Fingerprint> {
        self.fingerprints.iter()
    }
}

impl<'a> IntoIterator for &'a FingerprintSet {
    type Item = &'a Fingerprint;
    type IntoIter = std::slice::Iter<'a, Fingerprint>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn parse_fingerprint(entry: &serde_json::Value) -> Result<Fingerprint, String> {
    let serde_json::Value::Object(entry) = entry else {
        return Err("expected an object".to_string());
    };

    let destination_path = match entry.get("fn") {
        Some(serde_json::Value::String(path)) => path,
        Some(_) => return Err("\"fn\" must be a string".to_string()),
        None => return Err("missing \"fn\"".to_string()),
    };
    let Some(components) = crate::fs_utils::subpath_components(destination_path) else {
        return Err(format!("file path {destination_path:?} is not safe"));
    };

    let content_hash = match entry.get("sha1") {
        Some(serde_json::Value::String(hash)) => hash,
        Some(_) => return Err("\"sha1\" must be a string".to_string()),
        None => return Err("missing \"sha1\"".to_string()),
    };
    if !is_sha1_hex(content_hash) {
        return Err(format!("{content_hash:?} is not a sha1 digest"));
    }

    let mode = match entry.get("mode") {
        None | Some(serde_json::Value::Null) => DEFAULT_FILE_MODE,
        Some(mode) => parse_mode(mode)?,
    };
    if mode & MINIMUM_FILE_MODE != MINIMUM_FILE_MODE {
        return Err(format!(
            "file mode {mode:o} with path {destination_path:?} is invalid, minimum file mode is {MINIMUM_FILE_MODE:o}"
        ));
    }

    Ok(Fingerprint {
        destination_path: components.join("/"),
        content_hash: content_hash.clone(),
        mode,
    })
}

/// Strings are octal (`"644"`, `"0644"`); integers are the mode bits as-is.
fn parse_mode(mode: &serde_json::Value) -> Result<u32, String> {
    let parsed = match mode {
        serde_json::Value::String(mode) => {
            let digits = mode.trim();
            let digits = digits
                .strip_prefix("0o")
                .or_else(|| digits.strip_prefix('0').filter(|rest| !rest.is_empty()))
                .unwrap_or(digits);
            u32::from_str_radix(digits, 8).ok()
        }
        serde_json::Value::Number(mode) => mode.as_u64().and_then(|mode| u32::try_from(mode).ok()),
        _ => None,
    };

    match parsed {
        Some(mode) if mode <= 0o7777 => Ok(mode),
        _ => Err(format!("invalid file mode {mode}")),
    }
}

fn is_sha1_hex(hash: &str) -> bool {
    hash.len() == 40 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn serialize_mode<S>(mode: &u32, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&format!("{mode:o}"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;

    const SHA: &str = "8b381f8864b572841a26266791c64ae97738a659";

    #[test]
    fn test_parse_valid() {
        let set = FingerprintSet::parse(&json!([
            { "fn": "path/to/content.txt", "sha1": SHA, "mode": "644" },
            { "fn": "path/to/code.jar", "sha1": SHA, "mode": 0o600 },
            { "fn": "run.sh", "sha1": SHA },
        ]))
        .unwrap();

        let parsed = set
            .iter()
            .map(|f| (f.destination_path.as_str(), f.mode))
            .collect::<Vec<_>>();
        assert_eq!(
            parsed,
            [
                ("path/to/content.txt", 0o644),
                ("path/to/code.jar", 0o600),
                ("run.sh", DEFAULT_FILE_MODE),
            ]
        );
    }

    #[test]
    fn test_iteration_is_restartable() {
        let set = FingerprintSet::parse(&json!([
            { "fn": "a", "sha1": SHA },
            { "fn": "b", "sha1": SHA },
        ]))
        .unwrap();

        let first = set.iter().count();
        let second = (&set).into_iter().count();
        assert_eq!(first, 2);
        assert_eq!(second, 2);
    }

    #[test]
    fn test_parse_null_is_empty() {
        let set = FingerprintSet::parse(&serde_json::Value::Null).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_parse_rejects_bad_entries() {
        let cases = [
            json!({ "fn": "a", "sha1": SHA }),
            json!(["not an object"]),
            json!([{ "sha1": SHA }]),
            json!([{ "fn": "a" }]),
            json!([{ "fn": "a", "sha1": "deadbeef" }]),
            json!([{ "fn": "a", "sha1": SHA.to_uppercase() }]),
            json!([{ "fn": "../../etc/passwd", "sha1": SHA }]),
            json!([{ "fn": "/etc/passwd", "sha1": SHA }]),
            json!([{ "fn": "a", "sha1": SHA, "mode": "banana" }]),
            json!([{ "fn": "a", "sha1": SHA, "mode": "444" }]),
            json!([{ "fn": "a", "sha1": SHA }, { "fn": "./a", "sha1": SHA }]),
        ];

        for case in cases {
            let result = FingerprintSet::parse(&case);
            assert_eq!(
                result.map_err(|error| error.kind()).err(),
                Some(ErrorKind::MalformedFingerprints),
                "{case}"
            );
        }
    }

    #[test]
    fn test_to_json_round_trips_wire_shape() {
        let set = FingerprintSet::parse(&json!([
            { "fn": "a.txt", "sha1": SHA, "mode": "644" },
        ]))
        .unwrap();

        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&set.to_json()).unwrap(),
            json!([{ "fn": "a.txt", "sha1": SHA, "mode": "644" }])
        );
    }
}
