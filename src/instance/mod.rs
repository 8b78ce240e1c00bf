//! Server instance - the one managed server directory and how to launch it.
//!
//! Exactly one instance is active per supervisor. It is built from config
//! at daemon start and reset when the operator points craftd at a
//! different directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::supervisor::error::SupervisorError;

pub const SERVER_JAR_NAME: &str = "server.jar";
pub const EULA_FILE_NAME: &str = "eula.txt";
pub const PROPERTIES_FILE_NAME: &str = "server.properties";
pub const BACKUPS_DIR_NAME: &str = "backups";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInstance {
    /// Unique per daemon boot
    pub id: String,
    /// Operator-facing name
    pub name: String,
    /// Server root: jar, eula.txt, server.properties and the world live here
    pub root_dir: PathBuf,
    /// Java interpreter (usually just "java")
    pub java_bin: String,
    /// JVM arguments, inserted before `-jar`
    pub jvm_args: Vec<String>,
    /// Server artifact file name inside `root_dir`
    pub jar_name: String,
    /// World-data directory name inside `root_dir`
    pub world_dir_name: String,
}

impl ServerInstance {
    pub fn new(name: &str, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            root_dir: root_dir.into(),
            java_bin: "java".to_string(),
            jvm_args: vec!["-Xms1G".to_string(), "-Xmx1G".to_string()],
            jar_name: SERVER_JAR_NAME.to_string(),
            world_dir_name: "world".to_string(),
        }
    }

    pub fn jar_path(&self) -> PathBuf {
        self.root_dir.join(&self.jar_name)
    }

    pub fn eula_path(&self) -> PathBuf {
        self.root_dir.join(EULA_FILE_NAME)
    }

    pub fn properties_path(&self) -> PathBuf {
        self.root_dir.join(PROPERTIES_FILE_NAME)
    }

    pub fn world_path(&self) -> PathBuf {
        self.root_dir.join(&self.world_dir_name)
    }

    pub fn backups_path(&self) -> PathBuf {
        self.root_dir.join(BACKUPS_DIR_NAME)
    }

    /// The program and argument vector used to launch the server:
    /// `java <jvm_args> -jar <jar> nogui`.
    pub fn launch_command(&self) -> (String, Vec<String>) {
        let mut args = self.jvm_args.clone();
        args.push("-jar".to_string());
        args.push(self.jar_path().to_string_lossy().into_owned());
        args.push("nogui".to_string());
        (self.java_bin.clone(), args)
    }

    /// Artifact gate checked before every start: provisioning (an external
    /// collaborator) must have placed the jar and an accepted EULA marker.
    pub fn check_bootstrapped(&self) -> Result<(), SupervisorError> {
        if !self.root_dir.is_dir() {
            return Err(SupervisorError::NotBootstrapped(format!(
                "server directory {} does not exist",
                self.root_dir.display()
            )));
        }
        if !self.jar_path().is_file() {
            return Err(SupervisorError::NotBootstrapped(format!(
                "{} not found in {}",
                self.jar_name,
                self.root_dir.display()
            )));
        }
        if !self.eula_accepted() {
            return Err(SupervisorError::NotBootstrapped(
                "eula.txt is missing or not accepted".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether `eula.txt` exists and contains an uncommented `eula=true`.
    pub fn eula_accepted(&self) -> bool {
        let Ok(content) = std::fs::read_to_string(self.eula_path()) else {
            return false;
        };
        content
            .lines()
            .map(str::trim)
            .filter(|l| !l.starts_with('#'))
            .any(|l| {
                l.split_once('=')
                    .map(|(k, v)| k.trim() == "eula" && v.trim().eq_ignore_ascii_case("true"))
                    .unwrap_or(false)
            })
    }

    /// Write the EULA marker file.
    pub fn write_eula(&self, accept: bool) -> Result<(), SupervisorError> {
        let path = self.eula_path();
        ensure_dir(&self.root_dir)?;
        std::fs::write(&path, format!("eula={}\n", accept))
            .map_err(|e| SupervisorError::io(&path, e))?;
        tracing::info!("EULA marker set to {} at {}", accept, path.display());
        Ok(())
    }
}

pub fn ensure_dir(path: &Path) -> Result<(), SupervisorError> {
    std::fs::create_dir_all(path).map_err(|e| SupervisorError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance_in(dir: &Path) -> ServerInstance {
        ServerInstance::new("test-server", dir)
    }

    #[test]
    fn launch_command_shape() {
        let inst = instance_in(Path::new("/srv/mc"));
        let (program, args) = inst.launch_command();
        assert_eq!(program, "java");
        assert_eq!(args[0], "-Xms1G");
        assert_eq!(args[1], "-Xmx1G");
        assert_eq!(args[2], "-jar");
        assert!(args[3].ends_with("server.jar"));
        assert_eq!(args[4], "nogui");
    }

    #[test]
    fn bootstrap_gate_requires_jar_and_eula() {
        let dir = tempfile::tempdir().unwrap();
        let inst = instance_in(dir.path());

        // Missing jar
        let err = inst.check_bootstrapped().unwrap_err();
        assert!(matches!(err, SupervisorError::NotBootstrapped(_)));

        // Jar present, EULA missing
        std::fs::write(inst.jar_path(), b"jar").unwrap();
        assert!(inst.check_bootstrapped().is_err());

        // EULA declined
        inst.write_eula(false).unwrap();
        assert!(!inst.eula_accepted());
        assert!(inst.check_bootstrapped().is_err());

        // EULA accepted
        inst.write_eula(true).unwrap();
        assert!(inst.eula_accepted());
        assert!(inst.check_bootstrapped().is_ok());
    }

    #[test]
    fn eula_parsing_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let inst = instance_in(dir.path());
        std::fs::write(
            inst.eula_path(),
            "# By changing the setting below to TRUE you agree\n#eula=true\neula=TRUE\n",
        )
        .unwrap();
        assert!(inst.eula_accepted());
    }

    #[test]
    fn paths_derive_from_root() {
        let inst = instance_in(Path::new("/srv/mc"));
        assert_eq!(inst.world_path(), PathBuf::from("/srv/mc/world"));
        assert_eq!(inst.backups_path(), PathBuf::from("/srv/mc/backups"));
        assert_eq!(inst.properties_path(), PathBuf::from("/srv/mc/server.properties"));
    }

    #[test]
    fn ids_are_unique_per_instance() {
        let a = instance_in(Path::new("/a"));
        let b = instance_in(Path::new("/a"));
        assert_ne!(a.id, b.id);
    }
}
