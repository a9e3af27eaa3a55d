//! One camera's media graph.
//!
//! Topology: source -> depacketizer -> parser -> tee, with three standing
//! branches behind the tee (liveness tap, discard sink, optional recording)
//! and a dynamically attachable RTP egress branch. All queues leak
//! downstream so a slow consumer can never block the source.
//!
//! Graph callbacks run on the media runtime's own threads; they talk to the
//! rest of the process only through atomics, the `data` mutex and the FSM.
//! A fault inside a callback never unwinds past it: it becomes a transition
//! to RECONNECTING and a log line, and the supervisor takes it from there.

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer::{Element, ElementFactory};
use gstreamer_app as gst_app;
use log::{error, info, warn};
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::egress::{
    build_egress_queue, build_payloader, build_transcode_chain, build_udp_sink, EgressConfig,
    GateDecision, IdrGate,
};
use super::fsm::{PipelineFsm, PipelineState};
use super::hls::{
    generate_session_id, write_meta_json, HlsConfig, HlsSession, PlaylistWriter,
};
use super::stats::{PipelineMetrics, PipelineStats};
use super::{CodecTag, PipelineError};
use crate::utils::logging::redact_source_url;
use crate::utils::metrics::MediaMetrics;

/// Immutable per-camera configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Opaque identifier, also the supervisor registry key.
    pub camera_id: String,
    /// `rtsp://`, `rtsps://` or `mock://` source locator.
    pub source_url: String,
    /// Restrict the RTSP transport to TCP instead of negotiating UDP.
    pub prefer_tcp: bool,
}

impl PipelineConfig {
    pub fn is_mock(&self) -> bool {
        self.source_url.starts_with("mock://")
    }
}

/// State shared with the graph callback threads. Resolved through an `Arc`
/// rather than a self pointer so a late callback can never dangle.
struct Shared {
    camera_id: String,
    fsm: PipelineFsm,
    stats: Arc<PipelineStats>,
    metrics: Arc<MediaMetrics>,
    /// Reference instant for the relative last-frame clock below.
    epoch: Instant,
    /// Milliseconds since `epoch` of the newest probe-branch unit. Zero
    /// until the first unit, which makes a fresh pipeline's age start at
    /// construction time.
    last_frame_rel_ms: AtomicU64,
    depay_linked: AtomicBool,
    codec: AtomicU8,
    data: Mutex<LiveData>,
}

struct LiveData {
    last_fps_calc: Instant,
    frames_at_last_calc: u64,
    session: Option<HlsSession>,
}

struct Graph {
    pipeline: gst::Pipeline,
    tee: Element,
}

struct EgressBranch {
    chain: Vec<Element>,
    tee_pad: gst::Pad,
    config: EgressConfig,
}

pub struct IngestPipeline {
    config: PipelineConfig,
    hls_config: HlsConfig,
    shared: Arc<Shared>,
    graph: Mutex<Option<Graph>>,
    egress: Mutex<Option<EgressBranch>>,
}

impl IngestPipeline {
    pub fn new(
        config: PipelineConfig,
        hls_config: HlsConfig,
        metrics: Arc<MediaMetrics>,
    ) -> Self {
        let shared = Arc::new(Shared {
            camera_id: config.camera_id.clone(),
            fsm: PipelineFsm::new(),
            stats: Arc::new(PipelineStats::new()),
            metrics,
            epoch: Instant::now(),
            last_frame_rel_ms: AtomicU64::new(0),
            depay_linked: AtomicBool::new(false),
            codec: AtomicU8::new(CodecTag::Unknown as u8),
            data: Mutex::new(LiveData {
                last_fps_calc: Instant::now(),
                frames_at_last_calc: 0,
                session: None,
            }),
        });

        Self {
            config,
            hls_config,
            shared,
            graph: Mutex::new(None),
            egress: Mutex::new(None),
        }
    }

    /// Build the graph and request playback. Idempotent while STARTING or
    /// RUNNING; on failure every handle is released and the pipeline is back
    /// in STOPPED.
    pub fn start(&self) -> Result<(), PipelineError> {
        match self.shared.fsm.current() {
            PipelineState::Running | PipelineState::Starting => return Ok(()),
            _ => {}
        }

        self.shared.fsm.transition_to(PipelineState::Starting);
        info!(
            "[{}] starting ingestion from {}",
            self.config.camera_id,
            redact_source_url(&self.config.source_url)
        );

        // A restart out of RECONNECTING must not leak the failed graph.
        if let Some(old) = self.graph.lock().unwrap().take() {
            if let Some(bus) = old.pipeline.bus() {
                bus.unset_sync_handler();
            }
            let _ = old.pipeline.set_state(gst::State::Null);
        }

        let graph = match self.build_graph() {
            Ok(graph) => graph,
            Err(e) => {
                self.clear_session();
                self.shared.fsm.transition_to(PipelineState::Stopped);
                return Err(e);
            }
        };

        if graph.pipeline.set_state(gst::State::Playing).is_err() {
            error!(
                "[{}] failed to set pipeline to PLAYING",
                self.config.camera_id
            );
            if let Some(bus) = graph.pipeline.bus() {
                bus.unset_sync_handler();
            }
            let _ = graph.pipeline.set_state(gst::State::Null);
            self.clear_session();
            self.shared.fsm.transition_to(PipelineState::Stopped);
            return Err(PipelineError::StateChange(
                "pipeline refused to enter PLAYING".into(),
            ));
        }

        *self.graph.lock().unwrap() = Some(graph);
        Ok(())
    }

    /// Tear the graph down and release every handle. Synchronous: once this
    /// returns no further callbacks fire for this pipeline. On-disk session
    /// files stay where they are; the retention enforcer owns them now.
    pub fn stop(&self) {
        if self.shared.fsm.current() == PipelineState::Stopped {
            return;
        }

        info!("[{}] stopping ingestion", self.config.camera_id);
        self.shared.fsm.transition_to(PipelineState::Stopped);

        {
            let mut egress = self.egress.lock().unwrap();
            if egress.take().is_some() {
                self.shared.metrics.egress_active.dec();
            }
        }

        if let Some(graph) = self.graph.lock().unwrap().take() {
            if let Some(bus) = graph.pipeline.bus() {
                bus.unset_sync_handler();
            }
            let _ = graph.pipeline.set_state(gst::State::Null);
        }

        self.clear_session();
    }

    pub fn state(&self) -> PipelineState {
        self.shared.fsm.current()
    }

    pub fn fps(&self) -> f64 {
        self.shared.stats.fps()
    }

    /// Milliseconds since the newest frame, measured from pipeline
    /// construction when no frame has arrived yet. Lock-free.
    pub fn last_frame_age_ms(&self) -> u64 {
        let now_rel = self.shared.epoch.elapsed().as_millis() as u64;
        now_rel.saturating_sub(self.shared.last_frame_rel_ms.load(Ordering::Relaxed))
    }

    pub fn metrics(&self) -> PipelineMetrics {
        self.shared.stats.snapshot()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.shared.stats.clone()
    }

    pub fn codec(&self) -> CodecTag {
        CodecTag::from_u8(self.shared.codec.load(Ordering::Relaxed))
    }

    pub fn hls_session(&self) -> Option<HlsSession> {
        self.shared.data.lock().unwrap().session.clone()
    }

    pub fn egress_running(&self) -> bool {
        self.egress.lock().unwrap().is_some()
    }

    pub fn egress_config(&self) -> Option<EgressConfig> {
        self.egress.lock().unwrap().as_ref().map(|b| b.config.clone())
    }

    /// Attach the unicast egress branch to the running graph. Idempotent on
    /// the already-attached case; a failure rolls back any partial mutation
    /// and leaves the graph exactly as it was.
    pub fn start_egress(&self, config: EgressConfig) -> Result<(), PipelineError> {
        let mut egress = self.egress.lock().unwrap();
        if egress.is_some() {
            return Ok(());
        }

        let graph_guard = self.graph.lock().unwrap();
        let graph = graph_guard.as_ref().ok_or(PipelineError::NotRunning)?;

        info!(
            "[{}] starting egress to {}:{} (ssrc={} pt={})",
            self.config.camera_id, config.dst_host, config.dst_port, config.ssrc, config.pt
        );

        let queue = build_egress_queue()?;
        let pay = build_payloader(&config)?;
        let sink = build_udp_sink(&config)?;

        self.install_idr_gate(&pay)?;

        let mut chain = vec![queue];
        if self.codec() == CodecTag::H265 {
            chain.extend(build_transcode_chain(&self.config.camera_id)?);
        }
        chain.push(pay);
        chain.push(sink);

        graph
            .pipeline
            .add_many(&chain)
            .map_err(|_| PipelineError::Link("adding egress branch to bin".into()))?;

        if gst::Element::link_many(&chain).is_err() {
            let _ = graph.pipeline.remove_many(&chain);
            return Err(PipelineError::Link("egress branch".into()));
        }

        let tee_pad = match graph.tee.request_pad_simple("src_%u") {
            Some(pad) => pad,
            None => {
                let _ = graph.pipeline.remove_many(&chain);
                return Err(PipelineError::TeePad);
            }
        };

        let queue_sink = match chain[0].static_pad("sink") {
            Some(pad) => pad,
            None => {
                graph.tee.release_request_pad(&tee_pad);
                let _ = graph.pipeline.remove_many(&chain);
                return Err(PipelineError::Link("egress queue has no sink pad".into()));
            }
        };

        if tee_pad.link(&queue_sink).is_err() {
            graph.tee.release_request_pad(&tee_pad);
            let _ = graph.pipeline.remove_many(&chain);
            return Err(PipelineError::Link("tee -> egress queue".into()));
        }

        for element in &chain {
            if element.sync_state_with_parent().is_err() {
                warn!(
                    "[{}] egress element failed to sync state with parent",
                    self.config.camera_id
                );
            }
        }

        self.shared.metrics.egress_active.inc();
        *egress = Some(EgressBranch {
            chain,
            tee_pad,
            config,
        });
        Ok(())
    }

    /// Detach the egress branch if present. The probe branch keeps running
    /// throughout; only the tee pad feeding the egress queue is touched.
    pub fn stop_egress(&self) {
        let mut egress = self.egress.lock().unwrap();
        let Some(branch) = egress.take() else {
            return;
        };

        info!("[{}] stopping egress", self.config.camera_id);

        let graph_guard = self.graph.lock().unwrap();
        if let Some(graph) = graph_guard.as_ref() {
            if let Some(queue_sink) = branch.chain[0].static_pad("sink") {
                let _ = branch.tee_pad.unlink(&queue_sink);
            }
            graph.tee.release_request_pad(&branch.tee_pad);

            for element in branch.chain.iter().rev() {
                let _ = element.set_state(gst::State::Null);
            }
            let _ = graph.pipeline.remove_many(&branch.chain);
        }

        self.shared.metrics.egress_active.dec();
    }

    fn install_idr_gate(&self, pay: &Element) -> Result<(), PipelineError> {
        let pay_sink = pay
            .static_pad("sink")
            .ok_or_else(|| PipelineError::Link("payloader has no sink pad".into()))?;

        let gate = Mutex::new(IdrGate::new());
        let camera_id = self.config.camera_id.clone();
        pay_sink.add_probe(gst::PadProbeType::BUFFER, move |_pad, info| {
            let is_delta = match &info.data {
                Some(gst::PadProbeData::Buffer(buffer)) => {
                    buffer.flags().contains(gst::BufferFlags::DELTA_UNIT)
                }
                _ => return gst::PadProbeReturn::Ok,
            };

            match gate.lock().unwrap().on_buffer(is_delta) {
                GateDecision::Drop => gst::PadProbeReturn::Drop,
                GateDecision::PassAndRemove => {
                    info!("[{}] egress gate opened on first keyframe", camera_id);
                    gst::PadProbeReturn::Remove
                }
                GateDecision::Pass => gst::PadProbeReturn::Ok,
            }
        });
        Ok(())
    }

    fn build_graph(&self) -> Result<Graph, PipelineError> {
        let pipeline = gst::Pipeline::with_name(&format!("{}_pipeline", self.config.camera_id));

        let tee = ElementFactory::make("tee")
            .name("tee")
            .build()
            .map_err(|_| PipelineError::ElementCreate("tee"))?;

        // Liveness tap: small leaky queue into an unsynced appsink.
        let probe_queue = ElementFactory::make("queue")
            .name("probe_queue")
            .property_from_str("leaky", "downstream")
            .property("max-size-buffers", 5u32)
            .build()
            .map_err(|_| PipelineError::ElementCreate("queue"))?;
        let appsink_el = ElementFactory::make("appsink")
            .name("probe_sink")
            .property("sync", false)
            .build()
            .map_err(|_| PipelineError::ElementCreate("appsink"))?;

        // Second standing consumer so the tee keeps flowing even when the
        // probe branch is briefly blocked.
        let discard_queue = ElementFactory::make("queue")
            .name("discard_queue")
            .property_from_str("leaky", "downstream")
            .property("max-size-buffers", 1u32)
            .build()
            .map_err(|_| PipelineError::ElementCreate("queue"))?;
        let fakesink = ElementFactory::make("fakesink")
            .name("discard_sink")
            .build()
            .map_err(|_| PipelineError::ElementCreate("fakesink"))?;

        if self.config.is_mock() {
            info!("[{}] using mock source (videotestsrc)", self.config.camera_id);

            let source = ElementFactory::make("videotestsrc")
                .name("src")
                .property("is-live", true)
                .build()
                .map_err(|_| PipelineError::ElementCreate("videotestsrc"))?;
            let encoder = ElementFactory::make("x264enc")
                .name("encoder")
                .property("bitrate", 1000u32)
                .property_from_str("tune", "zerolatency")
                .property_from_str("speed-preset", "superfast")
                .property("key-int-max", 15u32)
                .build()
                .map_err(|_| PipelineError::ElementCreate("x264enc"))?;
            let parse = ElementFactory::make("h264parse")
                .name("parse")
                .build()
                .map_err(|_| PipelineError::ElementCreate("h264parse"))?;

            self.shared
                .codec
                .store(CodecTag::H264 as u8, Ordering::Relaxed);

            pipeline
                .add_many([
                    &source,
                    &encoder,
                    &parse,
                    &tee,
                    &probe_queue,
                    &appsink_el,
                    &discard_queue,
                    &fakesink,
                ])
                .map_err(|_| PipelineError::Link("adding elements to bin".into()))?;
            gst::Element::link_many([&source, &encoder, &parse, &tee])
                .map_err(|_| PipelineError::Link("mock source chain".into()))?;
        } else {
            let source = ElementFactory::make("rtspsrc")
                .name("src")
                .property("location", &self.config.source_url)
                .property("latency", 200u32)
                .build()
                .map_err(|_| PipelineError::ElementCreate("rtspsrc"))?;
            if self.config.prefer_tcp {
                source.set_property_from_str("protocols", "tcp");
            } else {
                source.set_property_from_str("protocols", "tcp+udp");
            }

            pipeline
                .add_many([
                    &source,
                    &tee,
                    &probe_queue,
                    &appsink_el,
                    &discard_queue,
                    &fakesink,
                ])
                .map_err(|_| PipelineError::Link("adding elements to bin".into()))?;

            // Depacketizer and parser are chosen once the source exposes a
            // pad and announces its encoding.
            let shared = self.shared.clone();
            let pipeline_weak = pipeline.downgrade();
            let tee_weak = tee.downgrade();
            source.connect_pad_added(move |_, pad| {
                let Some(pipeline) = pipeline_weak.upgrade() else {
                    return;
                };
                let Some(tee) = tee_weak.upgrade() else {
                    return;
                };
                let result = catch_unwind(AssertUnwindSafe(|| {
                    handle_pad_added(&shared, &pipeline, &tee, pad);
                }));
                if result.is_err() {
                    error!("[{}] pad-added handler panicked", shared.camera_id);
                    shared.fsm.transition_to(PipelineState::Reconnecting);
                }
            });
        }

        probe_queue
            .link(&appsink_el)
            .map_err(|_| PipelineError::Link("probe queue -> appsink".into()))?;
        discard_queue
            .link(&fakesink)
            .map_err(|_| PipelineError::Link("discard queue -> fakesink".into()))?;

        link_tee_branch(&tee, &probe_queue)?;
        link_tee_branch(&tee, &discard_queue)?;

        self.setup_recording_branch(&pipeline, &tee);

        let appsink = appsink_el
            .dynamic_cast::<gst_app::AppSink>()
            .map_err(|_| PipelineError::ElementCreate("appsink"))?;
        let shared = self.shared.clone();
        let pipeline_weak = pipeline.downgrade();
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        shared.on_sample(&sample, &pipeline_weak);
                    }));
                    if result.is_err() {
                        error!("[{}] sample handler panicked", shared.camera_id);
                        shared.fsm.transition_to(PipelineState::Reconnecting);
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        let bus = pipeline
            .bus()
            .ok_or_else(|| PipelineError::StateChange("pipeline has no bus".into()))?;
        let shared = self.shared.clone();
        bus.set_sync_handler(move |_, msg| {
            let result = catch_unwind(AssertUnwindSafe(|| {
                shared.on_bus_message(msg);
            }));
            if result.is_err() {
                error!("[{}] bus handler panicked", shared.camera_id);
                shared.fsm.transition_to(PipelineState::Reconnecting);
            }
            gst::BusSyncReply::Drop
        });

        Ok(Graph { pipeline, tee })
    }

    /// Best effort: a recording branch that cannot be built degrades the
    /// session instead of failing the pipeline.
    fn setup_recording_branch(&self, pipeline: &gst::Pipeline, tee: &Element) {
        if !self.hls_config.enabled {
            return;
        }

        let session_id = generate_session_id();
        let dir = self
            .hls_config
            .root_dir
            .join("live")
            .join(&self.config.camera_id)
            .join(&session_id);
        let mut session = HlsSession {
            session_id: session_id.clone(),
            dir: dir.clone(),
            degraded: false,
            last_error: String::new(),
        };

        if let Err(e) = fs::create_dir_all(&dir) {
            error!(
                "[{}] failed to create session dir {}: {}",
                self.config.camera_id,
                dir.display(),
                e
            );
            session.degraded = true;
            session.last_error = "filesystem error".into();
            self.store_session(session);
            return;
        }

        let writer = PlaylistWriter::new(
            dir.clone(),
            self.hls_config.segment_duration_sec,
            self.hls_config.playlist_length,
        );
        if let Err(e) = writer.write_initial_manifest() {
            error!(
                "[{}] failed to write initial playlist: {}",
                self.config.camera_id, e
            );
            session.degraded = true;
            session.last_error = "filesystem error".into();
            self.store_session(session);
            return;
        }
        if let Err(e) = write_meta_json(&dir, &self.config.camera_id, &session_id, &self.hls_config)
        {
            warn!(
                "[{}] failed to write meta.json sidecar: {}",
                self.config.camera_id, e
            );
        }

        let queue = ElementFactory::make("queue")
            .name("hls_queue")
            .property_from_str("leaky", "downstream")
            .property("max-size-buffers", 10u32)
            .build();
        let splitmux = ElementFactory::make("splitmuxsink")
            .name("hls_sink")
            .property("muxer-factory", "mp4mux")
            .property(
                "max-size-time",
                self.hls_config.segment_duration_sec as u64 * 1_000_000_000,
            )
            .property("async-finalize", true)
            .property("send-keyframe-requests", true)
            .build();
        let (Ok(queue), Ok(splitmux)) = (queue, splitmux) else {
            error!(
                "[{}] failed to create recording elements (splitmuxsink missing?)",
                self.config.camera_id
            );
            session.degraded = true;
            session.last_error = "recording element missing".into();
            self.store_session(session);
            return;
        };

        // The muxer asks for every fragment's location; each call also
        // rewrites the sliding-window manifest.
        let shared = self.shared.clone();
        splitmux.connect("format-location-full", false, move |args| {
            let index = args
                .get(1)
                .and_then(|v| v.get::<u32>().ok())
                .unwrap_or(0);
            let location = writer.segment_location(index);
            match catch_unwind(AssertUnwindSafe(|| writer.write_manifest(index))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => shared.mark_degraded(format!("playlist write failed: {e}")),
                Err(_) => shared.mark_degraded("playlist writer panicked".into()),
            }
            Some(location.to_string_lossy().to_string().to_value())
        });

        if pipeline.add_many([&queue, &splitmux]).is_err() {
            session.degraded = true;
            session.last_error = "recording branch rejected by bin".into();
            self.store_session(session);
            return;
        }
        if queue.link(&splitmux).is_err() {
            error!(
                "[{}] failed to link recording queue -> splitmuxsink",
                self.config.camera_id
            );
            let _ = pipeline.remove_many([&queue, &splitmux]);
            session.degraded = true;
            session.last_error = "recording branch link failed".into();
            self.store_session(session);
            return;
        }
        if link_tee_branch(tee, &queue).is_err() {
            error!(
                "[{}] failed to link tee -> recording branch",
                self.config.camera_id
            );
            let _ = pipeline.remove_many([&queue, &splitmux]);
            session.degraded = true;
            session.last_error = "recording branch link failed".into();
            self.store_session(session);
            return;
        }

        self.store_session(session);
    }

    fn store_session(&self, session: HlsSession) {
        let mut data = self.shared.data.lock().unwrap();
        if data.session.replace(session).is_none() {
            self.shared.metrics.hls_sessions_active.inc();
        }
    }

    fn clear_session(&self) {
        let mut data = self.shared.data.lock().unwrap();
        if data.session.take().is_some() {
            self.shared.metrics.hls_sessions_active.dec();
        }
    }
}

impl Drop for IngestPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn link_tee_branch(tee: &Element, queue: &Element) -> Result<(), PipelineError> {
    let tee_src = tee
        .request_pad_simple("src_%u")
        .ok_or(PipelineError::TeePad)?;
    let queue_sink = queue
        .static_pad("sink")
        .ok_or_else(|| PipelineError::Link("queue has no sink pad".into()))?;
    tee_src
        .link(&queue_sink)
        .map_err(|_| PipelineError::Link("tee -> queue".into()))?;
    Ok(())
}

/// Choose and wire the depacketizer/parser pair once the source announces
/// its encoding. An unrecognized encoding leaves the pad unlinked; the graph
/// stalls and the supervisor recovers it.
fn handle_pad_added(shared: &Shared, pipeline: &gst::Pipeline, tee: &Element, pad: &gst::Pad) {
    if shared.depay_linked.load(Ordering::Acquire) {
        return;
    }

    let Some(caps) = pad.current_caps() else {
        return;
    };
    let Some(structure) = caps.structure(0) else {
        return;
    };
    if !structure.name().starts_with("application/x-rtp") {
        return;
    }
    let media = structure.get::<&str>("media").unwrap_or("");
    if media != "video" {
        return;
    }
    let encoding = structure.get::<&str>("encoding-name").unwrap_or("");

    info!(
        "[{}] pad added: media={} encoding={}",
        shared.camera_id, media, encoding
    );

    let (depay_name, parse_name, codec) = match encoding {
        "H264" => ("rtph264depay", "h264parse", CodecTag::H264),
        "H265" => ("rtph265depay", "h265parse", CodecTag::H265),
        other => {
            warn!(
                "[{}] unsupported video encoding: {}",
                shared.camera_id, other
            );
            return;
        }
    };

    let depay = ElementFactory::make(depay_name).name("depay").build();
    let parse = ElementFactory::make(parse_name).name("parse").build();
    let (Ok(depay), Ok(parse)) = (depay, parse) else {
        error!(
            "[{}] failed to create {}/{}",
            shared.camera_id, depay_name, parse_name
        );
        return;
    };

    if codec == CodecTag::H265 {
        // Repeat VPS/SPS/PPS on every IDR so branches attaching mid-stream
        // can decode.
        parse.set_property("config-interval", -1i32);
    }

    if pipeline.add_many([&depay, &parse]).is_err() {
        error!("[{}] failed to add dynamic elements", shared.camera_id);
        return;
    }
    let _ = depay.sync_state_with_parent();
    let _ = parse.sync_state_with_parent();

    if gst::Element::link_many([&depay, &parse, tee]).is_err() {
        error!(
            "[{}] failed to link depay -> parse -> tee",
            shared.camera_id
        );
        return;
    }

    let Some(sinkpad) = depay.static_pad("sink") else {
        return;
    };
    if pad.link(&sinkpad).is_err() {
        error!(
            "[{}] failed to link source pad to depacketizer",
            shared.camera_id
        );
        return;
    }

    shared.codec.store(codec as u8, Ordering::Release);
    shared.depay_linked.store(true, Ordering::Release);
    info!("[{}] linked source pad ({})", shared.camera_id, encoding);
}

impl Shared {
    fn on_sample(&self, sample: &gst::Sample, pipeline: &glib::WeakRef<gst::Pipeline>) {
        let now_rel = self.epoch.elapsed().as_millis() as u64;
        self.last_frame_rel_ms.store(now_rel, Ordering::Relaxed);

        let Some(buffer) = sample.buffer() else {
            return;
        };
        self.stats.record_frame(buffer.size());

        if let Some(pipeline) = pipeline.upgrade() {
            if let (Some(running), Some(pts)) = (pipeline.current_running_time(), buffer.pts()) {
                let latency_ms = if running > pts {
                    (running - pts).mseconds() as i64
                } else {
                    0
                };
                self.stats.set_latency_ms(latency_ms);
            }
        }

        if self.fsm.current() == PipelineState::Starting {
            self.fsm.transition_to(PipelineState::Running);
            info!("[{}] first frame received, pipeline RUNNING", self.camera_id);
        }

        let mut data = self.data.lock().unwrap();
        let elapsed = data.last_fps_calc.elapsed();
        if elapsed.as_secs() >= 1 {
            let frames = self.stats.frames_processed.load(Ordering::Relaxed);
            let fps = (frames - data.frames_at_last_calc) as f64 / elapsed.as_secs_f64();
            self.stats.set_fps(fps);
            data.last_fps_calc = Instant::now();
            data.frames_at_last_calc = frames;
        }
    }

    fn on_bus_message(&self, msg: &gst::Message) {
        match msg.view() {
            gst::MessageView::Error(err) => {
                error!("[{}] stream error: {}", self.camera_id, err.error());
                self.metrics.record_error("gst");
                self.fsm.transition_to(PipelineState::Reconnecting);
            }
            gst::MessageView::Eos(..) => {
                warn!("[{}] end of stream", self.camera_id);
                self.fsm.transition_to(PipelineState::Reconnecting);
            }
            _ => {}
        }
    }

    fn mark_degraded(&self, last_error: String) {
        let mut data = self.data.lock().unwrap();
        if let Some(session) = data.session.as_mut() {
            if !session.degraded {
                warn!("[{}] recording degraded: {}", self.camera_id, last_error);
            }
            session.degraded = true;
            session.last_error = last_error;
        }
    }
}
