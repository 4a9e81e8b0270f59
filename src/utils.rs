use serde::{Deserialize, Serialize};

// Detected camera info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundDevice {
    pub model: String,
    pub port: String,
}

impl FoundDevice {
    pub fn new(model: String, port: String) -> Self {
        Self { model, port }
    }
}

/// Parse `gphoto2 --auto-detect` output:
///
/// ```text
/// Model                          Port
/// ----------------------------------------------------------
/// Canon EOS R6                   usb:001,004
/// ```
///
/// Model names contain spaces, so the port is the last column.
pub fn parse_auto_detect(output: &str) -> Vec<FoundDevice> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let line = line.trim();
            let (model, port) = line.rsplit_once(char::is_whitespace)?;
            let model = model.trim();
            if model.is_empty() {
                return None;
            }
            Some(FoundDevice::new(model.to_string(), port.to_string()))
        })
        .collect()
}
