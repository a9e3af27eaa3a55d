//! Unicast RTP egress branch: element construction, the IDR gate policy and
//! the H.265 transcode fallback chain.
//!
//! The branch itself is attached to a running graph by
//! [`IngestPipeline`](super::ingest::IngestPipeline); this module owns the
//! pieces that can be built and reasoned about in isolation.

use gstreamer::prelude::*;
use gstreamer::{Element, ElementFactory};
use log::{info, warn};

use super::PipelineError;

/// Destination parameters for one egress branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressConfig {
    pub dst_host: String,
    pub dst_port: u16,
    pub ssrc: u32,
    pub pt: u32,
}

/// What the gate probe should do with one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Delta unit before the first keyframe: discard it.
    Drop,
    /// First keyframe: let it through and uninstall the probe.
    PassAndRemove,
    /// Gate already open (probe removal raced a buffer): let it through.
    Pass,
}

/// Drops every delta unit until the first keyframe, then opens permanently.
/// A consumer that attaches mid-stream therefore always starts on an IDR
/// and never renders a partial group-of-pictures.
#[derive(Debug, Default)]
pub struct IdrGate {
    opened: bool,
}

impl IdrGate {
    pub fn new() -> Self {
        Self { opened: false }
    }

    pub fn on_buffer(&mut self, is_delta: bool) -> GateDecision {
        if self.opened {
            return GateDecision::Pass;
        }
        if is_delta {
            return GateDecision::Drop;
        }
        self.opened = true;
        GateDecision::PassAndRemove
    }
}

const H265_DECODERS: [&str; 2] = ["avdec_h265", "openh265dec"];
const H264_ENCODERS: [&str; 2] = ["x264enc", "openh264enc"];

pub fn build_egress_queue() -> Result<Element, PipelineError> {
    ElementFactory::make("queue")
        .name("egress_queue")
        .property_from_str("leaky", "downstream")
        .property("max-size-buffers", 200u32)
        .property("max-size-time", 0u64)
        .property("max-size-bytes", 0u32)
        .build()
        .map_err(|_| PipelineError::ElementCreate("queue"))
}

/// Payloader configured for mid-stream joiners: parameter sets are repeated
/// every second on top of the IDR gate.
pub fn build_payloader(config: &EgressConfig) -> Result<Element, PipelineError> {
    ElementFactory::make("rtph264pay")
        .name("egress_pay")
        .property("config-interval", 1i32)
        .property("ssrc", config.ssrc)
        .property("pt", config.pt)
        .build()
        .map_err(|_| PipelineError::ElementCreate("rtph264pay"))
}

pub fn build_udp_sink(config: &EgressConfig) -> Result<Element, PipelineError> {
    ElementFactory::make("udpsink")
        .name("egress_sink")
        .property("host", &config.dst_host)
        .property("port", config.dst_port as i32)
        .property("sync", false)
        .property("async", false)
        .build()
        .map_err(|_| PipelineError::ElementCreate("udpsink"))
}

/// Best-effort walk of the decoder/encoder preference lists for the
/// H.265 → H.264 transcode chain. Fails without side effects when no
/// candidate resolves; the egress wire format is fixed at H.264.
pub fn build_transcode_chain(camera_id: &str) -> Result<Vec<Element>, PipelineError> {
    let decoder = make_first_available(&H265_DECODERS, "egress_decoder")
        .ok_or(PipelineError::MissingCodec("H.265 decoder"))?;

    let convert = ElementFactory::make("videoconvert")
        .name("egress_convert")
        .build()
        .map_err(|_| PipelineError::ElementCreate("videoconvert"))?;

    let encoder = make_first_available(&H264_ENCODERS, "egress_encoder")
        .ok_or(PipelineError::MissingCodec("H.264 encoder"))?;
    configure_encoder(&encoder);

    info!(
        "[{}] transcoding H.265 to H.264 for egress ({} -> {})",
        camera_id,
        decoder
            .factory()
            .map(|f| f.name().to_string())
            .unwrap_or_default(),
        encoder
            .factory()
            .map(|f| f.name().to_string())
            .unwrap_or_default(),
    );

    Ok(vec![decoder, convert, encoder])
}

fn make_first_available(candidates: &[&'static str], name: &str) -> Option<Element> {
    for factory in candidates {
        match ElementFactory::make(factory).name(name).build() {
            Ok(element) => return Some(element),
            Err(_) => {
                warn!("{} not available, trying next candidate", factory);
            }
        }
    }
    None
}

fn configure_encoder(encoder: &Element) {
    let factory_name = encoder
        .factory()
        .map(|f| f.name().to_string())
        .unwrap_or_default();

    match factory_name.as_str() {
        "x264enc" => {
            // kbit/s for x264enc
            encoder.set_property("bitrate", 2000u32);
            encoder.set_property_from_str("tune", "zerolatency");
            encoder.set_property_from_str("speed-preset", "superfast");
            encoder.set_property("key-int-max", 30u32);
        }
        "openh264enc" => {
            // bit/s for openh264enc
            encoder.set_property("bitrate", 2_000_000u32);
            encoder.set_property("gop-size", 30u32);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run a buffer sequence through the gate the way the pad probe does:
    /// `Drop` discards, `PassAndRemove` emits and uninstalls, after which
    /// everything flows.
    fn run_gate(sequence: &[char]) -> Vec<char> {
        let mut gate = IdrGate::new();
        let mut installed = true;
        let mut emitted = Vec::new();

        for &unit in sequence {
            if !installed {
                emitted.push(unit);
                continue;
            }
            match gate.on_buffer(unit != 'I') {
                GateDecision::Drop => {}
                GateDecision::PassAndRemove => {
                    emitted.push(unit);
                    installed = false;
                }
                GateDecision::Pass => emitted.push(unit),
            }
        }
        emitted
    }

    #[test]
    fn test_gate_holds_until_first_keyframe() {
        let emitted = run_gate(&['P', 'P', 'P', 'I', 'P', 'P']);
        assert_eq!(emitted, vec!['I', 'P', 'P']);
    }

    #[test]
    fn test_gate_passes_immediate_keyframe() {
        let emitted = run_gate(&['I', 'P', 'P']);
        assert_eq!(emitted, vec!['I', 'P', 'P']);
    }

    #[test]
    fn test_gate_drops_everything_without_keyframe() {
        let emitted = run_gate(&['P', 'P', 'P', 'P']);
        assert!(emitted.is_empty());
    }

    #[test]
    fn test_open_gate_passes_later_delta_units() {
        // Probe removal can race one in-flight buffer; an opened gate must
        // keep passing either way.
        let mut gate = IdrGate::new();
        assert_eq!(gate.on_buffer(false), GateDecision::PassAndRemove);
        assert_eq!(gate.on_buffer(true), GateDecision::Pass);
        assert_eq!(gate.on_buffer(false), GateDecision::Pass);
    }
}
