//! Builds the audio graph description from a settings snapshot.
//!
//! The graph always has one source, the VAD level tap and the preroll buffer
//! on its main chain, ending in a tee. Each enabled output hangs off the tee
//! behind its own valve, so outputs can be gated while the graph is live:
//!
//! ```text
//! source ! caps ! level(vad-monitor) ! queue(preroll-buffer) ! tee(split)
//!   split. ! queue ! valve(recording-valve) ! wavenc ! filesink
//!   split. ! queue ! valve(stream-a-valve)  ! ... ! srtsink
//!   split. ! queue ! valve(stream-b-valve)  ! ... ! shout2send
//! ```

use std::fmt;
use std::time::Duration;

use nixon_core::{Branch, IcecastSettings, Settings, SrtSettings, StreamOutput};
use thiserror::Error;
use tracing::warn;

/// Level element feeding the VAD engine.
pub const VAD_ELEMENT: &str = "vad-monitor";
/// Queue retaining recent audio ahead of the outputs.
pub const PREROLL_ELEMENT: &str = "preroll-buffer";
/// Split point the outputs hang off.
pub const TEE_ELEMENT: &str = "split";
/// Terminating sink used when no output is enabled.
pub const NULL_SINK: &str = "null-sink";
/// Location the recording sink points at while no session is active.
pub const IDLE_RECORDING_FILE: &str = "pending.wav";
/// Interval between level measurements.
pub const LEVEL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("sample rate must be non-zero")]
    ZeroSampleRate,

    #[error("bit depth must be non-zero")]
    ZeroBitDepth,
}

/// Raw sample formats the capture chain can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    S16LE,
    S24LE,
    S32LE,
}

impl SampleFormat {
    pub fn from_bit_depth(bits: u16) -> Option<Self> {
        match bits {
            16 => Some(SampleFormat::S16LE),
            24 => Some(SampleFormat::S24LE),
            32 => Some(SampleFormat::S32LE),
            _ => None,
        }
    }

    pub fn bytes_per_sample(&self) -> u64 {
        match self {
            SampleFormat::S16LE => 2,
            SampleFormat::S24LE => 3,
            SampleFormat::S32LE => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SampleFormat::S16LE => "S16LE",
            SampleFormat::S24LE => "S24LE",
            SampleFormat::S32LE => "S32LE",
        }
    }
}

/// One element of the graph with its properties.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub factory: &'static str,
    pub name: Option<String>,
    properties: Vec<Property>,
}

#[derive(Debug, Clone, PartialEq)]
struct Property {
    key: &'static str,
    value: String,
    secret: bool,
}

impl Element {
    fn new(factory: &'static str) -> Self {
        Self {
            factory,
            name: None,
            properties: Vec::new(),
        }
    }

    fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn prop(mut self, key: &'static str, value: impl ToString) -> Self {
        self.properties.push(Property {
            key,
            value: value.to_string(),
            secret: false,
        });
        self
    }

    fn secret(mut self, key: &'static str, value: impl ToString) -> Self {
        self.properties.push(Property {
            key,
            value: value.to_string(),
            secret: true,
        });
        self
    }

    /// Value of a property, if set.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }

    fn render(&self, out: &mut String, redact: bool) {
        out.push_str(self.factory);
        if let Some(name) = &self.name {
            out.push_str(" name=");
            out.push_str(&quote(name));
        }
        for p in &self.properties {
            out.push(' ');
            out.push_str(p.key);
            out.push('=');
            if redact && p.secret {
                out.push_str("***");
            } else {
                out.push_str(&quote(&p.value));
            }
        }
    }
}

/// Quote values the launch syntax would otherwise split.
fn quote(value: &str) -> String {
    let needs_quotes =
        value.is_empty() || value.chars().any(|c| c.is_whitespace() || ",;!\"".contains(c));
    if needs_quotes {
        format!("\"{}\"", value.replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

/// A gated output hanging off the split point.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSegment {
    pub branch: Branch,
    pub elements: Vec<Element>,
}

/// Graph description built from one settings snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    format: SampleFormat,
    preroll_bytes: u64,
    main: Vec<Element>,
    outputs: Vec<OutputSegment>,
}

impl Topology {
    /// Build the description for `settings`.
    ///
    /// Only structurally invalid audio settings fail. Outputs that are enabled
    /// but lack connection parameters are left out with a warning.
    pub fn build(settings: &Settings) -> Result<Self, TopologyError> {
        let audio = &settings.audio;
        if audio.sample_rate == 0 {
            return Err(TopologyError::ZeroSampleRate);
        }
        if audio.bit_depth == 0 {
            return Err(TopologyError::ZeroBitDepth);
        }

        let format = SampleFormat::from_bit_depth(audio.bit_depth).unwrap_or_else(|| {
            warn!(bit_depth = audio.bit_depth, "Unsupported bit depth, defaulting to 16-bit");
            SampleFormat::S16LE
        });

        let preroll_bytes = preroll_bytes(
            audio.sample_rate,
            format,
            audio.channels,
            settings.auto_record.preroll_secs,
        );

        let mut main = Vec::new();
        if audio.device.is_empty() {
            warn!("No audio device configured, using a test tone as source");
            main.push(
                Element::new("audiotestsrc")
                    .named("source")
                    .prop("wave", "sine")
                    .prop("freq", 440)
                    .prop("is-live", true),
            );
        } else {
            main.push(
                Element::new("pulsesrc")
                    .named("source")
                    .prop("device", &audio.device),
            );
        }

        let mut caps = format!(
            "audio/x-raw,format={},rate={}",
            format.as_str(),
            audio.sample_rate
        );
        if audio.channels > 0 {
            caps.push_str(&format!(",channels={}", audio.channels));
        }

        main.extend([
            Element::new("audioconvert"),
            Element::new("audioresample"),
            Element::new("capsfilter").prop("caps", caps),
            Element::new("level")
                .named(VAD_ELEMENT)
                .prop("interval", LEVEL_INTERVAL.as_nanos())
                .prop("post-messages", true),
            Element::new("queue")
                .named(PREROLL_ELEMENT)
                .prop("max-size-bytes", preroll_bytes)
                .prop("max-size-buffers", 0)
                .prop("max-size-time", 0)
                .prop("leaky", "downstream"),
            Element::new("tee").named(TEE_ELEMENT),
        ]);

        let mut outputs = Vec::new();

        if settings.branch_configured(Branch::Recording) {
            let location = settings.recording.directory.join(IDLE_RECORDING_FILE);
            outputs.push(gated(
                Branch::Recording,
                vec![
                    Element::new("wavenc"),
                    sink(Branch::Recording, "filesink")
                        .prop("location", location.display())
                        .prop("async", false),
                ],
            ));
        } else if settings.recording.enabled {
            warn!("Recording enabled without a directory. Skipping recording branch.");
        }

        for output in settings.stream_outputs() {
            if !output.is_enabled() {
                continue;
            }
            if !output.is_complete() {
                warn!(
                    protocol = output.protocol(),
                    "Stream enabled but configuration is incomplete. Skipping stream branch."
                );
                continue;
            }
            let elements = match &output {
                StreamOutput::Srt(srt) => srt_elements(srt),
                StreamOutput::Icecast(icecast) => icecast_elements(icecast),
            };
            outputs.push(gated(output.branch(), elements));
        }

        Ok(Self {
            format,
            preroll_bytes,
            main,
            outputs,
        })
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn preroll_bytes(&self) -> u64 {
        self.preroll_bytes
    }

    pub fn outputs(&self) -> &[OutputSegment] {
        &self.outputs
    }

    /// Every branch present in the graph, main-chain branches first.
    pub fn branches(&self) -> Vec<Branch> {
        let mut branches = vec![Branch::VadMonitor, Branch::Preroll];
        branches.extend(self.outputs.iter().map(|o| o.branch));
        branches
    }

    pub fn has_branch(&self, branch: Branch) -> bool {
        match branch {
            Branch::VadMonitor | Branch::Preroll => true,
            _ => self.outputs.iter().any(|o| o.branch == branch),
        }
    }

    /// Whether the null sink had to be appended.
    pub fn has_null_sink(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Launch-syntax description handed to the engine.
    pub fn describe(&self) -> String {
        self.render(false)
    }

    /// Same as [`Topology::describe`] with credentials masked, for logs.
    pub fn describe_redacted(&self) -> String {
        self.render(true)
    }

    fn render(&self, redact: bool) -> String {
        let mut out = String::new();
        render_chain(&mut out, &self.main, redact);

        for output in &self.outputs {
            out.push_str(&format!(" {}. ! ", TEE_ELEMENT));
            render_chain(&mut out, &output.elements, redact);
        }

        if self.has_null_sink() {
            out.push_str(&format!(
                " {}. ! queue ! fakesink name={} sync=false",
                TEE_ELEMENT, NULL_SINK
            ));
        }

        out
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe_redacted())
    }
}

fn render_chain(out: &mut String, elements: &[Element], redact: bool) {
    for (i, element) in elements.iter().enumerate() {
        if i > 0 {
            out.push_str(" ! ");
        }
        element.render(out, redact);
    }
}

/// Bytes of audio the preroll buffer holds. Falls back to one second of
/// audio when the configured duration yields nothing.
pub fn preroll_bytes(sample_rate: u32, format: SampleFormat, channels: u16, secs: u32) -> u64 {
    let per_second = u64::from(sample_rate) * format.bytes_per_sample() * u64::from(channels);
    let bytes = per_second * u64::from(secs);
    if bytes > 0 {
        bytes
    } else {
        u64::from(sample_rate) * format.bytes_per_sample() * u64::from(channels.max(1))
    }
}

/// Prefix `elements` with the branch queue and its closed valve.
fn gated(branch: Branch, elements: Vec<Element>) -> OutputSegment {
    let prefix = branch.element_prefix();
    let mut chain = vec![
        Element::new("queue").named(format!("{}-queue", prefix)),
        Element::new("valve")
            .named(format!("{}-valve", prefix))
            .prop("drop", true),
    ];
    chain.extend(elements);
    OutputSegment {
        branch,
        elements: chain,
    }
}

fn sink(branch: Branch, factory: &'static str) -> Element {
    Element::new(factory).named(format!("{}-sink", branch.element_prefix()))
}

fn srt_elements(srt: &SrtSettings) -> Vec<Element> {
    vec![
        Element::new("audioconvert"),
        Element::new("fdkaacenc").prop("bitrate", u64::from(srt.bitrate_kbps) * 1000),
        Element::new("mpegtsmux"),
        sink(Branch::StreamA, "srtsink")
            .prop(
                "uri",
                format!("srt://{}:{}?mode={}", srt.host, srt.port, srt.mode.as_str()),
            )
            .prop("latency", srt.latency_ms),
    ]
}

fn icecast_elements(icecast: &IcecastSettings) -> Vec<Element> {
    vec![
        Element::new("audioresample"),
        Element::new("audioconvert"),
        Element::new("lamemp3enc")
            .prop("target", "bitrate")
            .prop("bitrate", icecast.bitrate_kbps)
            .prop("cbr", true),
        sink(Branch::StreamB, "shout2send")
            .prop("ip", &icecast.host)
            .prop("port", icecast.port)
            .prop("mount", &icecast.mount)
            .prop("username", &icecast.username)
            .secret("password", &icecast.password),
    ]
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use nixon_core::SrtMode;

    use super::*;

    fn streaming_settings() -> Settings {
        let mut settings = Settings::default();
        settings.srt.enabled = true;
        settings.srt.host = "203.0.113.5".to_string();
        settings.srt.mode = SrtMode::Caller;
        settings.icecast.enabled = true;
        settings.icecast.password = "hackme".to_string();
        settings
    }

    #[test]
    fn test_default_has_recording_only() {
        let topology = Topology::build(&Settings::default()).unwrap();
        assert_eq!(
            topology.branches(),
            vec![Branch::VadMonitor, Branch::Preroll, Branch::Recording]
        );
        let description = topology.describe();
        assert!(description.contains("valve name=recording-valve drop=true"));
        assert!(description.contains("level name=vad-monitor interval=100000000"));
        assert!(!description.contains("stream-a"));
        assert!(!description.contains(NULL_SINK));
    }

    #[test]
    fn test_all_outputs() {
        let topology = Topology::build(&streaming_settings()).unwrap();
        assert!(topology.has_branch(Branch::StreamA));
        assert!(topology.has_branch(Branch::StreamB));

        let description = topology.describe();
        assert!(description.contains("uri=srt://203.0.113.5:9000?mode=caller"));
        assert!(description.contains("fdkaacenc bitrate=128000"));
        assert!(description.contains("shout2send name=stream-b-sink ip=127.0.0.1 port=8000"));
        assert_eq!(description.matches(" split. ! ").count(), 3);
    }

    #[test]
    fn test_branches_match_settings_exactly() {
        for mask in 0u8..64 {
            let mut settings = Settings::default();
            settings.recording.enabled = mask & 1 != 0;
            if mask & 2 == 0 {
                settings.recording.directory = PathBuf::new();
            }
            settings.srt.enabled = mask & 4 != 0;
            if mask & 8 != 0 {
                settings.srt.host = "srt.example".to_string();
            }
            settings.icecast.enabled = mask & 16 != 0;
            if mask & 32 == 0 {
                settings.icecast.mount.clear();
            }

            let topology = Topology::build(&settings).unwrap();
            for branch in Branch::GATED {
                assert_eq!(
                    topology.has_branch(branch),
                    settings.branch_configured(branch),
                    "mask {mask:#08b}, branch {branch}"
                );
                let valve = branch.valve_name().unwrap();
                assert_eq!(
                    topology.describe().contains(&valve),
                    settings.branch_configured(branch)
                );
            }
            assert_eq!(topology.has_null_sink(), topology.outputs().is_empty());
        }
    }

    #[test]
    fn test_no_outputs_appends_null_sink() {
        let mut settings = Settings::default();
        settings.recording.enabled = false;
        let topology = Topology::build(&settings).unwrap();
        assert!(topology.has_null_sink());
        assert!(
            topology
                .describe()
                .ends_with("split. ! queue ! fakesink name=null-sink sync=false")
        );
    }

    #[test]
    fn test_preroll_bytes() {
        assert_eq!(preroll_bytes(48_000, SampleFormat::S24LE, 2, 10), 2_880_000);

        let topology = Topology::build(&Settings::default()).unwrap();
        assert_eq!(topology.preroll_bytes(), 2_880_000);
        assert!(topology.describe().contains("max-size-bytes=2880000"));
    }

    #[test]
    fn test_zero_preroll_defaults_to_one_second() {
        let mut settings = Settings::default();
        settings.auto_record.preroll_secs = 0;
        let topology = Topology::build(&settings).unwrap();
        assert_eq!(topology.preroll_bytes(), 48_000 * 3 * 2);

        assert_eq!(preroll_bytes(44_100, SampleFormat::S16LE, 0, 5), 88_200);
    }

    #[test]
    fn test_unsupported_bit_depth_falls_back() {
        let mut settings = Settings::default();
        settings.audio.bit_depth = 20;
        let topology = Topology::build(&settings).unwrap();
        assert_eq!(topology.format(), SampleFormat::S16LE);
        assert_eq!(topology.preroll_bytes(), 48_000 * 2 * 2 * 10);
        assert!(topology.describe().contains("format=S16LE"));
    }

    #[test]
    fn test_invalid_settings() {
        let mut settings = Settings::default();
        settings.audio.sample_rate = 0;
        assert_eq!(
            Topology::build(&settings).unwrap_err(),
            TopologyError::ZeroSampleRate
        );

        let mut settings = Settings::default();
        settings.audio.bit_depth = 0;
        assert_eq!(
            Topology::build(&settings).unwrap_err(),
            TopologyError::ZeroBitDepth
        );
    }

    #[test]
    fn test_source_selection_and_caps() {
        let mut settings = Settings::default();
        settings.audio.device = "alsa_input.usb-Focusrite".to_string();
        let description = Topology::build(&settings).unwrap().describe();
        assert!(description.starts_with("pulsesrc name=source device=alsa_input.usb-Focusrite"));
        assert!(description.contains("caps=\"audio/x-raw,format=S24LE,rate=48000,channels=2\""));

        settings.audio.device.clear();
        settings.audio.channels = 0;
        let description = Topology::build(&settings).unwrap().describe();
        assert!(description.starts_with("audiotestsrc name=source"));
        assert!(description.contains("caps=\"audio/x-raw,format=S24LE,rate=48000\""));
    }

    #[test]
    fn test_redacted_description_hides_password() {
        let topology = Topology::build(&streaming_settings()).unwrap();
        assert!(topology.describe().contains("password=hackme"));
        assert!(!topology.describe_redacted().contains("hackme"));
        assert!(topology.to_string().contains("password=***"));
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain"), "plain");
        assert_eq!(quote("two words"), "\"two words\"");
        assert_eq!(quote(""), "\"\"");
        assert_eq!(quote("a\"b"), "\"a\\\"b\"");
    }
}
