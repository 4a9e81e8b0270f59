//! Named settings with typed values: camera-backed exposure parameters plus
//! the session values that shape captures and schedules.

use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use super::camera::Camera;
use crate::{Error, Result, ScheduleConfig};

const ISO_KEY: &str = "iso";
const SHUTTER_KEY: &str = "shutterspeed";
const APERTURE_KEY: &str = "aperture";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Setting {
    Iso,
    Shutter,
    Aperture,
    BulbDuration,
    DownloadInterval,
    KeepOnCamera,
    DownloadToHost,
}

impl Setting {
    pub const ALL: [Setting; 7] = [
        Setting::Iso,
        Setting::Shutter,
        Setting::Aperture,
        Setting::BulbDuration,
        Setting::DownloadInterval,
        Setting::KeepOnCamera,
        Setting::DownloadToHost,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Setting::Iso => "iso",
            Setting::Shutter => "shutter",
            Setting::Aperture => "aperture",
            Setting::BulbDuration => "bulb_duration",
            Setting::DownloadInterval => "download_interval",
            Setting::KeepOnCamera => "keep_on_camera",
            Setting::DownloadToHost => "download_to_host",
        }
    }

    /// Camera config key for settings stored on the body.
    pub fn camera_key(self) -> Option<&'static str> {
        match self {
            Setting::Iso => Some(ISO_KEY),
            Setting::Shutter => Some(SHUTTER_KEY),
            Setting::Aperture => Some(APERTURE_KEY),
            _ => None,
        }
    }

    /// Parse a raw string (as received from a form or query) into this
    /// setting's value type.
    pub fn parse_value(self, raw: &str) -> Result<SettingValue> {
        let raw = raw.trim();
        let invalid = |message: &str| Error::InvalidSetting {
            setting: self.name().to_string(),
            message: message.to_string(),
        };

        match self {
            Setting::Iso | Setting::Shutter | Setting::Aperture => {
                if raw.is_empty() {
                    return Err(invalid("empty value"));
                }
                Ok(SettingValue::Text(raw.to_string()))
            }
            Setting::BulbDuration => match raw.parse::<u64>() {
                Ok(0) => Err(invalid("must be at least one second")),
                Ok(secs) => Ok(SettingValue::Seconds(secs)),
                Err(_) => Err(invalid("expected whole seconds")),
            },
            Setting::DownloadInterval => match raw {
                "" | "none" | "off" => Ok(SettingValue::Unset),
                _ => raw
                    .parse::<u64>()
                    .map(SettingValue::Seconds)
                    .map_err(|_| invalid("expected whole seconds or `off`")),
            },
            Setting::KeepOnCamera | Setting::DownloadToHost => match raw {
                "true" | "1" | "yes" | "on" => Ok(SettingValue::Flag(true)),
                "false" | "0" | "no" | "off" => Ok(SettingValue::Flag(false)),
                _ => Err(invalid("expected true or false")),
            },
        }
    }
}

impl FromStr for Setting {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        Setting::ALL
            .into_iter()
            .find(|setting| setting.name() == name)
            .ok_or_else(|| Error::UnknownSetting(name.to_string()))
    }
}

impl std::fmt::Display for Setting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SettingValue {
    Text(String),
    Seconds(u64),
    Flag(bool),
    Unset,
}

/// One row of [`Settings::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingEntry {
    pub name: Setting,
    pub value: SettingValue,
    pub options: Option<Vec<String>>,
}

/// Get/set dispatch over [`Setting`].
pub struct Settings {
    camera: Arc<dyn Camera>,
    session: Mutex<ScheduleConfig>,
}

impl Settings {
    pub fn new(camera: Arc<dyn Camera>, session: ScheduleConfig) -> Self {
        Self {
            camera,
            session: Mutex::new(session),
        }
    }

    fn session_guard(&self) -> MutexGuard<'_, ScheduleConfig> {
        // Session values are plain data; a panic elsewhere cannot leave them
        // half-written.
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current session values
    pub fn session(&self) -> ScheduleConfig {
        self.session_guard().clone()
    }

    pub fn get(&self, setting: Setting) -> Result<SettingValue> {
        let session = || self.session_guard();
        let camera = |key: &str| -> Result<SettingValue> {
            Ok(self
                .camera
                .get_config(key)?
                .map_or(SettingValue::Unset, SettingValue::Text))
        };
        Ok(match setting {
            Setting::Iso => camera(ISO_KEY)?,
            Setting::Shutter => camera(SHUTTER_KEY)?,
            Setting::Aperture => camera(APERTURE_KEY)?,
            Setting::BulbDuration => SettingValue::Seconds(session().bulb_seconds),
            Setting::DownloadInterval => session()
                .download_interval_secs
                .map_or(SettingValue::Unset, SettingValue::Seconds),
            Setting::KeepOnCamera => SettingValue::Flag(session().keep_on_camera),
            Setting::DownloadToHost => SettingValue::Flag(session().download_to_host),
        })
    }

    pub fn set(&self, setting: Setting, value: SettingValue) -> Result<()> {
        let mismatch = || Error::InvalidSetting {
            setting: setting.name().to_string(),
            message: format!("{value:?} has the wrong type"),
        };

        if let Some(key) = setting.camera_key() {
            let SettingValue::Text(text) = &value else {
                return Err(mismatch());
            };
            return self.camera.set_config(key, text);
        }

        let mut session = self.session_guard();
        match (setting, &value) {
            (Setting::BulbDuration, SettingValue::Seconds(secs)) if *secs > 0 => {
                session.bulb_seconds = *secs
            }
            (Setting::DownloadInterval, SettingValue::Seconds(secs)) => {
                session.download_interval_secs = Some(*secs)
            }
            (Setting::DownloadInterval, SettingValue::Unset) => {
                session.download_interval_secs = None
            }
            (Setting::KeepOnCamera, SettingValue::Flag(flag)) => session.keep_on_camera = *flag,
            (Setting::DownloadToHost, SettingValue::Flag(flag)) => {
                session.download_to_host = *flag
            }
            _ => return Err(mismatch()),
        }
        Ok(())
    }

    /// Allowed values, for settings that have a fixed list.
    pub fn options(&self, setting: Setting) -> Result<Option<Vec<String>>> {
        match setting.camera_key() {
            Some(key) => {
                let choices = self.camera.config_choices(key)?;
                Ok((!choices.is_empty()).then_some(choices))
            }
            None if matches!(setting, Setting::KeepOnCamera | Setting::DownloadToHost) => {
                Ok(Some(vec!["true".to_string(), "false".to_string()]))
            }
            None => Ok(None),
        }
    }

    /// Every setting with its value and options.
    pub fn snapshot(&self) -> Result<Vec<SettingEntry>> {
        Setting::ALL
            .into_iter()
            .map(|setting| {
                Ok(SettingEntry {
                    name: setting,
                    value: self.get(setting)?,
                    options: self.options(setting)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::camera::{ExposureId, ExposureRequest};
    use crate::capture::process::CommandSpec;
    use std::collections::HashMap;

    #[derive(Default)]
    struct ConfigOnlyCamera {
        values: Mutex<HashMap<String, String>>,
    }

    impl Camera for ConfigOnlyCamera {
        fn is_ready(&self) -> Result<bool> {
            Ok(true)
        }
        fn video_command(&self) -> CommandSpec {
            CommandSpec::new("true", Vec::<String>::new())
        }
        fn release(&self) -> Result<()> {
            Ok(())
        }
        fn capture(&self, _: &ExposureRequest) -> Result<ExposureId> {
            Ok(ExposureId("IMG_0001.CR3".into()))
        }
        fn get_config(&self, key: &str) -> Result<Option<String>> {
            Ok(self.values.lock().unwrap().get(key).cloned())
        }
        fn set_config(&self, key: &str, value: &str) -> Result<()> {
            self.values
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }
        fn config_choices(&self, key: &str) -> Result<Vec<String>> {
            Ok(match key {
                "iso" => vec!["100".into(), "800".into()],
                _ => Vec::new(),
            })
        }
        fn download_latest(&self) -> Result<bool> {
            Ok(false)
        }
        fn sync_clock(&self) -> Result<()> {
            Ok(())
        }
    }

    fn settings() -> Settings {
        Settings::new(Arc::new(ConfigOnlyCamera::default()), ScheduleConfig::default())
    }

    #[test]
    fn names_round_trip() {
        for setting in Setting::ALL {
            assert_eq!(setting.name().parse::<Setting>().unwrap(), setting);
        }
        assert!(matches!(
            "focus".parse::<Setting>(),
            Err(Error::UnknownSetting(_))
        ));
    }

    #[test]
    fn camera_settings_go_to_the_camera() {
        let settings = settings();
        assert_eq!(settings.get(Setting::Iso).unwrap(), SettingValue::Unset);

        settings
            .set(Setting::Shutter, SettingValue::Text("bulb".into()))
            .unwrap();
        assert_eq!(
            settings.get(Setting::Shutter).unwrap(),
            SettingValue::Text("bulb".into())
        );
        assert_eq!(
            settings.options(Setting::Iso).unwrap(),
            Some(vec!["100".to_string(), "800".to_string()])
        );
        assert_eq!(settings.options(Setting::Aperture).unwrap(), None);
    }

    #[test]
    fn session_settings_are_typed() {
        let settings = settings();
        let value = Setting::DownloadInterval.parse_value("300").unwrap();
        settings.set(Setting::DownloadInterval, value).unwrap();
        assert_eq!(settings.session().download_interval_secs, Some(300));

        settings
            .set(Setting::DownloadInterval, Setting::DownloadInterval.parse_value("off").unwrap())
            .unwrap();
        assert_eq!(settings.session().download_interval_secs, None);

        let err = settings
            .set(Setting::KeepOnCamera, SettingValue::Seconds(1))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSetting { .. }));
        assert!(Setting::BulbDuration.parse_value("0").is_err());
        assert!(Setting::KeepOnCamera.parse_value("maybe").is_err());
    }

    #[test]
    fn each_setting_reads_from_its_own_store() {
        let camera = Arc::new(ConfigOnlyCamera::default());
        camera.set_config("shutterspeed", "1/200").unwrap();
        camera.set_config("aperture", "2.8").unwrap();
        let settings = Settings::new(camera, ScheduleConfig::default());

        assert_eq!(
            settings.get(Setting::Shutter).unwrap(),
            SettingValue::Text("1/200".into())
        );
        assert_eq!(
            settings.get(Setting::Aperture).unwrap(),
            SettingValue::Text("2.8".into())
        );
        assert_eq!(settings.get(Setting::Iso).unwrap(), SettingValue::Unset);
        assert_eq!(
            settings.get(Setting::KeepOnCamera).unwrap(),
            SettingValue::Flag(true)
        );
        assert_eq!(
            settings.get(Setting::DownloadInterval).unwrap(),
            SettingValue::Unset
        );
    }

    #[test]
    fn snapshot_lists_every_setting() {
        let entries = settings().snapshot().unwrap();
        assert_eq!(entries.len(), Setting::ALL.len());
        assert_eq!(entries[3].value, SettingValue::Seconds(30));
    }
}
