//! DAB Band III channel plan and the welle-cli web API
//!
//! welle-cli serves the ensemble it is tuned to over HTTP: `/api/mux` lists
//! the services, `POST /api/channel/{sid}` selects one for `/mp3`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReceiverError, Result};

/// Channel block centre frequencies in kHz
const DAB_CHANNELS: &[(&str, u32)] = &[
    ("5A", 174_928),
    ("5B", 176_640),
    ("5C", 178_352),
    ("5D", 180_064),
    ("6A", 181_936),
    ("6B", 183_648),
    ("6C", 185_360),
    ("6D", 187_072),
    ("7A", 188_928),
    ("7B", 190_640),
    ("7C", 192_352),
    ("7D", 194_064),
    ("8A", 195_936),
    ("8B", 197_648),
    ("8C", 199_360),
    ("8D", 201_072),
    ("9A", 202_928),
    ("9B", 204_640),
    ("9C", 206_352),
    ("9D", 208_064),
    ("10A", 209_936),
    ("10B", 211_648),
    ("10C", 213_360),
    ("10D", 215_072),
    ("11A", 216_928),
    ("11B", 218_640),
    ("11C", 220_352),
    ("11D", 222_064),
    ("12A", 223_936),
    ("12B", 225_648),
    ("12C", 227_360),
    ("12D", 229_072),
    ("13A", 230_784),
    ("13B", 232_496),
    ("13C", 234_208),
    ("13D", 235_776),
    ("13E", 237_488),
    ("13F", 239_200),
];

/// Canonical name and centre frequency of a channel ("12b" → "12B")
pub fn lookup_channel(name: &str) -> Result<(&'static str, u32)> {
    let wanted = name.trim();
    DAB_CHANNELS
        .iter()
        .copied()
        .find(|(channel, _)| channel.eq_ignore_ascii_case(wanted))
        .ok_or_else(|| ReceiverError::UnknownChannel(wanted.to_string()))
}

pub fn channel_frequency_khz(name: &str) -> Result<u32> {
    lookup_channel(name).map(|(_, khz)| khz)
}

pub fn channel_names() -> impl Iterator<Item = &'static str> {
    DAB_CHANNELS.iter().map(|(name, _)| *name)
}

/// One service (programme) of the received ensemble
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DabService {
    /// Service id as welle-cli prints it, e.g. `0x4e33`
    pub sid: String,
    pub label: String,
    pub short_label: Option<String>,
    pub pty: Option<String>,
    /// Path of this service's MP3 stream on the welle-cli server
    pub audio_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MuxJson {
    #[serde(default)]
    services: Vec<RawService>,
}

#[derive(Debug, Deserialize)]
struct RawService {
    sid: RawSid,
    #[serde(default)]
    label: Option<RawLabel>,
    #[serde(default)]
    ptystring: Option<String>,
    #[serde(default)]
    url_mp3: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawSid {
    Text(String),
    Number(u64),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawLabel {
    Text(String),
    Labels {
        label: String,
        #[serde(default)]
        shortlabel: Option<String>,
    },
}

fn non_blank(text: &str) -> Option<String> {
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

impl From<RawService> for DabService {
    fn from(raw: RawService) -> Self {
        let sid = match raw.sid {
            RawSid::Text(text) => text.trim().to_string(),
            RawSid::Number(n) => format!("0x{:04x}", n),
        };
        let (label, short_label) = match raw.label {
            Some(RawLabel::Text(text)) => (non_blank(&text), None),
            Some(RawLabel::Labels { label, shortlabel }) => {
                (non_blank(&label), shortlabel.as_deref().and_then(non_blank))
            }
            None => (None, None),
        };
        Self {
            label: label.unwrap_or_else(|| sid.clone()),
            sid,
            short_label,
            pty: raw.ptystring.as_deref().and_then(non_blank),
            audio_path: raw.url_mp3.as_deref().and_then(non_blank),
        }
    }
}

/// Client for the welle-cli web server of the running digital receiver
#[derive(Debug, Clone)]
pub struct MuxClient {
    client: reqwest::Client,
    base_url: String,
}

impl MuxClient {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let base_url = format!("http://{}:{}", host, port);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| ReceiverError::DigitalApi {
                url: base_url.clone(),
                source,
            })?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Services of the current ensemble
    pub async fn services(&self) -> Result<Vec<DabService>> {
        let url = format!("{}/api/mux", self.base_url);
        let api_error = |source| ReceiverError::DigitalApi {
            url: url.clone(),
            source,
        };

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(api_error)?;
        let mux: MuxJson = response.json().await.map_err(api_error)?;
        Ok(mux.services.into_iter().map(DabService::from).collect())
    }

    /// Make `sid` the service streamed on `/mp3`
    pub async fn select_service(&self, sid: &str) -> Result<()> {
        let url = format!("{}/api/channel/{}", self.base_url, sid);
        self.client
            .post(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|source| ReceiverError::DigitalApi {
                url: url.clone(),
                source,
            })?;
        Ok(())
    }
}

/// What the digital receiver is tuned to and where its audio is served
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DabStatus {
    pub channel: String,
    pub frequency_khz: u32,
    pub web_port: u16,
    pub audio_url: String,
    /// Services last reported by welle-cli
    pub services: Vec<DabService>,
    /// Selected service id
    pub service: Option<String>,
}

impl DabStatus {
    pub fn new(channel: &str, host: &str, web_port: u16) -> Result<Self> {
        let (channel, frequency_khz) = lookup_channel(channel)?;
        Ok(Self {
            channel: channel.to_string(),
            frequency_khz,
            web_port,
            audio_url: format!("http://{}:{}/mp3", host, web_port),
            services: Vec::new(),
            service: None,
        })
    }

    pub fn find_service(&self, sid: &str) -> Option<&DabService> {
        let sid = sid.trim();
        self.services.iter().find(|s| s.sid.eq_ignore_ascii_case(sid))
    }
}
