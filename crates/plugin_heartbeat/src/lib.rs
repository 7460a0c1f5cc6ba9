//! Heartbeat plugins: a periodic event source and a sink processor.
//!
//! The source emits one pipeline event per configured interval into
//! every pipeline it feeds; the sink stamps each event it receives.
//! Hosts link this crate directly and call
//! [`register_builtin_factories`], or load it as a bundle through the
//! exported entry symbol.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use argus_event_system::{Event, MessageType};
use argus_platform::{
    register_plugin_factory, EventSource, Pipeline, PlatformContext, Plugin, PluginContext,
    PluginFactory,
};

/// Event id carried by every heartbeat tick.
pub const HEARTBEAT_EVENT_ID: u32 = 901;

/// Platform property naming the tick interval in seconds.
pub const INTERVAL_PROPERTY: &str = "heartbeat.interval.secs";

const DEFAULT_INTERVAL_SECS: u64 = 60;

/// Emits a heartbeat event into its pipelines on a fixed cadence. A
/// direct `heartbeat_force_tick` event triggers one out of cadence.
pub struct HeartbeatSource {
    me: Weak<HeartbeatSource>,
    ctx: PluginContext,
    pipelines: Mutex<Vec<Arc<Pipeline>>>,
    beats: AtomicU64,
    outstanding: AtomicI64,
    timer_seq: AtomicU64,
}

impl HeartbeatSource {
    fn interval(&self) -> Duration {
        let secs = self
            .ctx
            .platform()
            .map(|p| p.property(INTERVAL_PROPERTY, ""))
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(DEFAULT_INTERVAL_SECS);
        Duration::from_secs(secs.max(1))
    }

    fn beat(&self) {
        let count = self.beats.fetch_add(1, Ordering::SeqCst) + 1;
        let mut event = self
            .ctx
            .create_pipeline_event(MessageType::Statistics, HEARTBEAT_EVENT_ID)
            .with_name("heartbeat", "tick");
        event.set_int_value("beat", count as i64);

        // Deliver outside the list lock; processors run arbitrary code.
        let pipelines = self
            .pipelines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for pipeline in pipelines {
            if pipeline.can_process_event(&event) {
                self.outstanding.fetch_add(1, Ordering::SeqCst);
                pipeline.process_event(event.clone());
            } else {
                debug!(pipeline = pipeline.name(), "pipeline declined heartbeat");
            }
        }
    }
}

impl Plugin for HeartbeatSource {
    fn version(&self) -> &str {
        "1.0.0"
    }

    fn on_load(&self) {
        let interval = self.interval();
        let me = self.me.clone();
        let seq = self.ctx.work_loop().add_timer_task(
            move || {
                if let Some(source) = me.upgrade() {
                    source.beat();
                }
            },
            interval,
            true,
        );
        self.timer_seq.store(seq, Ordering::SeqCst);
        info!(interval_secs = interval.as_secs(), "heartbeat source armed");
    }

    fn on_unload(&self) {
        let seq = self.timer_seq.swap(0, Ordering::SeqCst);
        if seq != 0 {
            self.ctx.work_loop().remove_event(seq);
        }
        info!(
            beats = self.beats.load(Ordering::SeqCst),
            "heartbeat source disarmed"
        );
    }

    fn on_event(&self, event: &mut Event) -> bool {
        if event.composite_name() == "heartbeat_force_tick" {
            self.beat();
        }
        true
    }

    fn dump(&self, _args: &[String]) -> String {
        format!(
            "beats={} outstanding={}",
            self.beats.load(Ordering::SeqCst),
            self.outstanding.load(Ordering::SeqCst)
        )
    }

    fn as_event_source(&self) -> Option<&dyn EventSource> {
        Some(self)
    }
}

impl EventSource for HeartbeatSource {
    fn add_pipeline(&self, pipeline: Arc<Pipeline>) {
        debug!(pipeline = pipeline.name(), "heartbeat pipeline attached");
        self.pipelines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(pipeline);
    }

    fn start_event_source(&self) {
        info!("heartbeat source started");
        self.beat();
    }

    fn recycle(&self, event: &Event) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        debug!(beat = event.int_value("beat"), "heartbeat completed");
    }

    fn pause_dispatch(&self, processor: &str) {
        warn!(processor, "heartbeat parked mid-pipeline");
    }
}

fn new_heartbeat_source(ctx: PluginContext) -> Arc<dyn Plugin> {
    Arc::new_cyclic(|me: &Weak<HeartbeatSource>| HeartbeatSource {
        me: me.clone(),
        ctx,
        pipelines: Mutex::new(Vec::new()),
        beats: AtomicU64::new(0),
        outstanding: AtomicI64::new(0),
        timer_seq: AtomicU64::new(0),
    })
}

/// Terminal pipeline stage; stamps each heartbeat it sees.
pub struct HeartbeatSink {
    ctx: PluginContext,
    processed: AtomicU64,
}

impl Plugin for HeartbeatSink {
    fn version(&self) -> &str {
        "1.0.0"
    }

    fn on_event(&self, event: &mut Event) -> bool {
        let total = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        event.set_value(self.ctx.name(), "Done");
        info!(beat = event.int_value("beat"), total, "💓 heartbeat received");
        true
    }

    fn on_unload(&self) {
        info!(
            processed = self.processed.load(Ordering::SeqCst),
            "heartbeat sink retired"
        );
    }

    fn dump(&self, _args: &[String]) -> String {
        format!("processed={}", self.processed.load(Ordering::SeqCst))
    }
}

fn new_heartbeat_sink(ctx: PluginContext) -> Arc<dyn Plugin> {
    Arc::new(HeartbeatSink { ctx, processed: AtomicU64::new(0) })
}

/// Registers both heartbeat plugins for hosts linking this crate
/// directly instead of loading it as a bundle.
pub fn register_builtin_factories() {
    register_plugin_factory("HeartbeatSource", PluginFactory::resident(new_heartbeat_source));
    register_plugin_factory("HeartbeatSink", PluginFactory::proxied(new_heartbeat_sink));
}

argus_platform::declare_plugin_bundle! {
    "HeartbeatSource" => new_heartbeat_source, proxy = false, startup = true;
    "HeartbeatSink" => new_heartbeat_sink, proxy = true, startup = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_platform::{
        PipelineInfo, Platform, PlatformConfig, PlatformContext, PluginInfo,
    };
    use std::thread;
    use std::time::Instant;
    use tempfile::tempdir;

    fn heartbeat_config(root: &std::path::Path, interval_secs: &str) -> PlatformConfig {
        let mut config = PlatformConfig {
            config_dir: root.join("config"),
            work_dir: root.join("work"),
            persist_dir: root.join("persist"),
            cloud_update_dir: root.join("cloud"),
            pid_file: Some(root.join("run.pid")),
            ..PlatformConfig::default()
        };
        config
            .properties
            .insert(INTERVAL_PROPERTY.to_string(), interval_secs.to_string());
        let mut source = PluginInfo::named("HeartbeatSource");
        source.event_source = true;
        source.pipelines = vec!["heartbeat".to_string()];
        config.plugins = vec![source, PluginInfo::named("HeartbeatSink")];
        config.pipelines = vec![PipelineInfo {
            name: "heartbeat".to_string(),
            plugins: vec!["HeartbeatSink".to_string()],
        }];
        config
    }

    #[test]
    fn heartbeats_flow_from_source_to_sink() {
        register_builtin_factories();
        let tmp = tempdir().unwrap();
        let platform = Platform::init(heartbeat_config(tmp.path(), "1")).unwrap();

        let sink = platform.get_plugin("HeartbeatSink").unwrap();
        let deadline = Instant::now() + Duration::from_secs(4);
        while Instant::now() < deadline && !sink.holds_instance() {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(sink.holds_instance(), "sink never received a heartbeat");

        let report = platform.dump(&[]);
        assert!(report.contains("beats="));
        assert!(report.contains("processed="));
    }

    #[test]
    fn forced_ticks_reach_the_sink_synchronously() {
        register_builtin_factories();
        let tmp = tempdir().unwrap();
        // Cadence parked far away; only forced ticks move the counter.
        let platform = Platform::init(heartbeat_config(tmp.path(), "3600")).unwrap();

        let trigger = Event::new("tester", MessageType::Sys, 1).with_name("heartbeat", "force_tick");
        assert!(platform
            .post_sync_event_to_target("HeartbeatSource", trigger)
            .unwrap());

        let sink = platform.get_plugin("HeartbeatSink").unwrap();
        assert!(sink.holds_instance());
        assert!(platform.dump(&[]).contains("processed="));
    }
}
