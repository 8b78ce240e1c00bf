//! Flat key/value property files (`server.properties`).
//!
//! craftd does not interpret the values; it only round-trips them for the
//! operator interface. Order is preserved, `#` comment lines and blanks
//! are skipped on read and not rewritten.

use std::path::Path;

use crate::supervisor::error::SupervisorError;

/// Read a property file into ordered key/value pairs. A missing file is
/// an empty property set, matching a server that has not yet generated one.
pub fn read_properties(path: &Path) -> Result<Vec<(String, String)>, SupervisorError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content =
        std::fs::read_to_string(path).map_err(|e| SupervisorError::io(path, e))?;
    let mut props = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            props.push((k.to_string(), v.to_string()));
        }
    }
    Ok(props)
}

/// Write a property file, copying any existing file to `<name>.bak` first.
pub fn write_properties(
    path: &Path,
    props: &[(String, String)],
) -> Result<(), SupervisorError> {
    if path.exists() {
        let backup = path.with_extension("bak");
        std::fs::copy(path, &backup).map_err(|e| SupervisorError::io(&backup, e))?;
    }
    let mut out = String::new();
    for (k, v) in props {
        out.push_str(k);
        out.push('=');
        out.push_str(v);
        out.push('\n');
    }
    std::fs::write(path, out).map_err(|e| SupervisorError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.properties");
        let props = vec![
            ("motd".to_string(), "A Minecraft Server".to_string()),
            ("server-port".to_string(), "25565".to_string()),
            ("level-name".to_string(), "world".to_string()),
        ];
        write_properties(&path, &props).unwrap();
        assert_eq!(read_properties(&path).unwrap(), props);
    }

    #[test]
    fn comments_and_blanks_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.properties");
        std::fs::write(
            &path,
            "#Minecraft server properties\n#Wed Jan 01 00:00:00 UTC 2025\n\nmotd=hi=there\npvp=true\n",
        )
        .unwrap();
        let props = read_properties(&path).unwrap();
        assert_eq!(props.len(), 2);
        // value may itself contain '='; only the first one splits
        assert_eq!(props[0], ("motd".to_string(), "hi=there".to_string()));
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_properties(&dir.path().join("nope.properties"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn overwrite_leaves_bak_copy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.properties");
        write_properties(&path, &[("a".into(), "1".into())]).unwrap();
        write_properties(&path, &[("a".into(), "2".into())]).unwrap();

        let bak = path.with_extension("bak");
        assert!(bak.exists());
        assert_eq!(read_properties(&bak).unwrap(), vec![("a".to_string(), "1".to_string())]);
        assert_eq!(read_properties(&path).unwrap(), vec![("a".to_string(), "2".to_string())]);
    }
}
