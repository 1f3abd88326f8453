use crate::device::DeviceType;
use crate::error::{Error, Result};
use crate::grid::MAX_THREADS;
use crate::platform::Platform;
use crate::runtime::Runtime;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// A runtime setting changed through [`Runtime::set_parameter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parameter {
    /// Device classes selection may pick from. Only accepted before a
    /// device has been selected.
    TargetDevice(DeviceType),
    /// Compiler flags for every later build. Empty means none.
    BuildOptions(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub target_device: DeviceType,
    pub build_options: String,
    /// Ceiling for the first local work-group dimension.
    pub max_work_group_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_device: DeviceType::ALL,
            build_options: String::new(),
            max_work_group_size: MAX_THREADS,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if DeviceType::from_bits(self.target_device.bits()).is_none() {
            return Err(Error::config(format!(
                "target_device {:#x} is not a device class mask",
                self.target_device.bits()
            )));
        }

        if self.max_work_group_size == 0 {
            return Err(Error::config("max_work_group_size must be > 0"));
        }

        Ok(())
    }

    /// Options as handed to the compiler.
    pub fn build_options(&self) -> Option<&str> {
        if self.build_options.is_empty() {
            None
        } else {
            Some(&self.build_options)
        }
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn target_device(mut self, target: DeviceType) -> Self {
        self.config.target_device = target;
        self
    }

    pub fn build_options<S: Into<String>>(mut self, options: S) -> Self {
        self.config.build_options = options.into();
        self
    }

    pub fn max_work_group_size(mut self, size: usize) -> Self {
        self.config.max_work_group_size = size;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// A kernel definition document.
///
/// ```json
/// { "kernel": { "file": "vadd.cl", "name": "vadd", "target": { "type": "gpu" } } }
/// ```
///
/// `target` may be omitted; an unknown type selects from every class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDef {
    pub file: PathBuf,
    pub name: String,
    pub target: DeviceType,
}

#[derive(Deserialize)]
struct Document {
    kernel: KernelSection,
}

#[derive(Deserialize)]
struct KernelSection {
    #[serde(default)]
    file: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    target: Option<TargetSection>,
}

#[derive(Deserialize)]
struct TargetSection {
    #[serde(rename = "type", default)]
    kind: String,
}

impl KernelDef {
    /// Parses a document. Relative kernel paths are checked against the
    /// current directory.
    pub fn from_json(json: &str) -> Result<Self> {
        Self::parse(json, None)
    }

    /// Reads a document from disk. Relative kernel paths resolve against
    /// the document's directory.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        Self::parse(&json, path.parent())
    }

    fn parse(json: &str, base: Option<&Path>) -> Result<Self> {
        let doc: Document =
            serde_json::from_str(json).map_err(|e| Error::config(format!("invalid kernel document: {}", e)))?;
        let section = doc.kernel;

        if section.file.is_empty() {
            return Err(Error::config("kernel file is empty"));
        }
        if section.name.is_empty() {
            return Err(Error::config("kernel name is empty"));
        }

        let mut file = PathBuf::from(&section.file);
        if let Some(base) = base.filter(|_| file.is_relative()) {
            file = base.join(file);
        }
        std::fs::metadata(&file)
            .map_err(|e| Error::config(format!("kernel file {}: {}", file.display(), e)))?;

        let target = section
            .target
            .and_then(|t| DeviceType::from_name(&t.kind))
            .unwrap_or(DeviceType::ALL);

        Ok(Self {
            file,
            name: section.name,
            target,
        })
    }

    /// Points `runtime` at this definition's target class.
    pub fn apply<P: Platform>(&self, runtime: &mut Runtime<P>) -> Result<()> {
        runtime.set_parameter(Parameter::TargetDevice(self.target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.target_device, DeviceType::ALL);
        assert_eq!(config.max_work_group_size, 512);
        assert_eq!(config.build_options(), None);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::builder()
            .target_device(DeviceType::GPU)
            .build_options("-cl-fast-relaxed-math")
            .max_work_group_size(256)
            .build()
            .unwrap();

        assert_eq!(config.target_device, DeviceType::GPU);
        assert_eq!(config.build_options(), Some("-cl-fast-relaxed-math"));
        assert_eq!(config.max_work_group_size, 256);
    }

    #[test]
    fn test_invalid_config() {
        assert!(Config::builder().max_work_group_size(0).build().is_err());

        let err = Config::builder()
            .target_device(DeviceType::from_bits_retain(0x10))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_kernel_def() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "__kernel void vadd(__global float* a) {{}}").unwrap();
        let path = file.path().display().to_string();

        let json = format!(
            r#"{{"kernel": {{"file": {:?}, "name": "vadd", "target": {{"type": "gpu"}}}}}}"#,
            path
        );
        let def = KernelDef::from_json(&json).unwrap();
        assert_eq!(def.name, "vadd");
        assert_eq!(def.target, DeviceType::GPU);

        let json = format!(r#"{{"kernel": {{"file": {:?}, "name": "vadd"}}}}"#, path);
        assert_eq!(KernelDef::from_json(&json).unwrap().target, DeviceType::ALL);

        let json = format!(
            r#"{{"kernel": {{"file": {:?}, "name": "vadd", "target": {{"type": "fpga"}}}}}}"#,
            path
        );
        assert_eq!(KernelDef::from_json(&json).unwrap().target, DeviceType::ALL);
    }

    #[test]
    fn test_kernel_def_rejects() {
        let err = KernelDef::from_json(r#"{"kernel": {"file": "", "name": "k"}}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = KernelDef::from_json(r#"{"kernel": {"file": "/no/such/kernel.cl", "name": "k"}}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = KernelDef::from_json("not json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_kernel_def_load_relative() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("k.cl"), "__kernel void k(void) {}").unwrap();
        let doc = dir.path().join("kernel.json");
        std::fs::write(&doc, r#"{"kernel": {"file": "k.cl", "name": "k", "target": {"type": "cpu"}}}"#).unwrap();

        let def = KernelDef::load(&doc).unwrap();
        assert_eq!(def.file, dir.path().join("k.cl"));
        assert_eq!(def.target, DeviceType::CPU);
    }
}
