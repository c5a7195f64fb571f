//! Source events: (re)open or close one capture chain

use super::{Event, EventCategory, EventFactory, EventParams, SourceEventType};
use crate::error::EventError;
use crate::pipeline::types::SourceKind;
use crate::recorder::PipelineContext;
use std::sync::Arc;

/// Tear down the chain of `source` if live, then open it with fresh state
pub struct OpenSourceEvent {
    context: Arc<PipelineContext>,
    source: SourceKind,
    restart_encoder: bool,
}

impl Event for OpenSourceEvent {
    fn category(&self) -> EventCategory {
        EventCategory::Source
    }

    fn name(&self) -> &'static str {
        "open source"
    }

    fn work(self: Box<Self>) -> anyhow::Result<()> {
        self.context.open_source(self.source, self.restart_encoder)
    }
}

pub struct CloseSourceEvent {
    context: Arc<PipelineContext>,
    source: SourceKind,
}

impl Event for CloseSourceEvent {
    fn category(&self) -> EventCategory {
        EventCategory::Source
    }

    fn name(&self) -> &'static str {
        "close source"
    }

    fn work(self: Box<Self>) -> anyhow::Result<()> {
        self.context.close_source(self.source)
    }
}

pub struct SourceEventFactory;

impl EventFactory for SourceEventFactory {
    fn category(&self) -> EventCategory {
        EventCategory::Source
    }

    fn create(
        &self,
        context: &Arc<PipelineContext>,
        params: EventParams,
    ) -> Result<Box<dyn Event>, EventError> {
        let EventParams::Source {
            sub_type,
            source,
            restart_encoder,
        } = params
        else {
            return Err(EventError::InvalidParams(EventCategory::Source));
        };
        let context = Arc::clone(context);
        Ok(match sub_type {
            SourceEventType::OpenSource => Box::new(OpenSourceEvent {
                context,
                source,
                restart_encoder,
            }),
            SourceEventType::CloseSource => Box::new(CloseSourceEvent { context, source }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::synthetic::{SyntheticOptions, SyntheticRuntime};
    use crate::codec::CodecRuntime;
    use crate::config::RecorderConfig;
    use crate::event::ControlEventType;
    use crate::pipeline::types::MediaKind;
    use crate::recorder::NoopObserver;
    use std::thread::sleep;
    use std::time::{Duration, Instant};

    fn context() -> (Arc<PipelineContext>, Arc<SyntheticRuntime>) {
        let mut config = RecorderConfig::default();
        config.video.width = 64;
        config.video.height = 36;
        let runtime = Arc::new(SyntheticRuntime::new(SyntheticOptions::from_config(&config)));
        let context = PipelineContext::new(
            config,
            Arc::clone(&runtime) as Arc<dyn CodecRuntime>,
            Arc::new(NoopObserver),
            |_| Arc::new(|_: Duration| {}),
        )
        .unwrap();
        context.initialize().unwrap();
        (context, runtime)
    }

    fn run(context: &Arc<PipelineContext>, params: EventParams) {
        SourceEventFactory.create(context, params).unwrap().work().unwrap();
    }

    #[test]
    fn test_control_params_rejected() {
        let (context, _runtime) = context();
        let created =
            SourceEventFactory.create(&context, EventParams::Control(ControlEventType::Pause));
        assert!(matches!(
            created,
            Err(EventError::InvalidParams(EventCategory::Source))
        ));
        context.teardown().unwrap();
    }

    #[test]
    fn test_open_already_open_source() {
        let (context, _runtime) = context();
        assert_eq!(
            context.live_sources(),
            vec![SourceKind::Screen, SourceKind::SystemAudio]
        );

        // reopening keeps a single chain for the media kind
        run(&context, EventParams::open_source(SourceKind::Screen));
        assert_eq!(
            context.live_sources(),
            vec![SourceKind::Screen, SourceKind::SystemAudio]
        );
        assert_eq!(context.video_source(), Some(SourceKind::Screen));

        // opening the counterpart replaces it
        run(&context, EventParams::open_source(SourceKind::Camera));
        assert_eq!(
            context.live_sources(),
            vec![SourceKind::Camera, SourceKind::SystemAudio]
        );
        assert_eq!(context.video_source(), Some(SourceKind::Camera));
        context.teardown().unwrap();
    }

    #[test]
    fn test_close_active_video_source_while_recording() {
        let (context, runtime) = context();
        context.begin_recording().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !context.muxer().header_written() && Instant::now() < deadline {
            sleep(Duration::from_millis(10));
        }
        assert!(context.muxer().header_written());

        run(&context, EventParams::close_source(SourceKind::Screen));
        assert_eq!(context.video_source(), None);
        assert_eq!(context.live_sources(), vec![SourceKind::SystemAudio]);
        sleep(Duration::from_millis(200));

        // the video stream ends at EOF and the container is finalized
        let started = Instant::now();
        context.finish_recording(Duration::from_secs(3)).unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));

        let report = runtime.probe().snapshot();
        assert_eq!(report.trailers_written, 1);
        let pts: Vec<i64> = report
            .packets_of(MediaKind::Video)
            .filter_map(|p| p.pts)
            .collect();
        assert!(!pts.is_empty());
        assert!(pts.windows(2).all(|w| w[0] < w[1]));
        assert!(report.packets_of(MediaKind::Audio).count() > 0);
        context.teardown().unwrap();
    }
}
