//! The fixed task roster started once at boot.

use std::time::Duration;

use crate::config::TaskTimings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskId {
    LinkCheck,
    SessionCheck,
    Telemetry,
    Attributes,
    AttributeChanges,
    SessionPump,
    LightControl,
    FanControl,
    Motion,
    Lcd,
    DisplayCounter,
    DisplayRender,
}

impl TaskId {
    pub const ALL: [TaskId; 12] = [
        TaskId::LinkCheck,
        TaskId::SessionCheck,
        TaskId::Telemetry,
        TaskId::Attributes,
        TaskId::AttributeChanges,
        TaskId::SessionPump,
        TaskId::LightControl,
        TaskId::FanControl,
        TaskId::Motion,
        TaskId::Lcd,
        TaskId::DisplayCounter,
        TaskId::DisplayRender,
    ];

    /// Thread name; FreeRTOS truncates task names to 16 bytes.
    pub fn name(self) -> &'static str {
        match self {
            TaskId::LinkCheck => "link-check",
            TaskId::SessionCheck => "session-check",
            TaskId::Telemetry => "telemetry",
            TaskId::Attributes => "attributes",
            TaskId::AttributeChanges => "attr-changes",
            TaskId::SessionPump => "session-pump",
            TaskId::LightControl => "light-control",
            TaskId::FanControl => "fan-control",
            TaskId::Motion => "motion",
            TaskId::Lcd => "lcd",
            TaskId::DisplayCounter => "7seg-counter",
            TaskId::DisplayRender => "7seg-render",
        }
    }

    pub fn stack_size(self) -> usize {
        match self {
            TaskId::LinkCheck | TaskId::SessionCheck | TaskId::SessionPump => 12 * 1024,
            TaskId::Telemetry | TaskId::Attributes | TaskId::AttributeChanges => 8 * 1024,
            _ => 4 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSpec {
    pub id: TaskId,
    /// Sleep between iterations; `None` runs back to back.
    pub period: Option<Duration>,
}

impl TaskSpec {
    pub fn name(&self) -> &'static str {
        self.id.name()
    }

    pub fn stack_size(&self) -> usize {
        self.id.stack_size()
    }
}

pub fn roster(timings: &TaskTimings) -> [TaskSpec; 12] {
    TaskId::ALL.map(|id| TaskSpec {
        id,
        period: period_ms(id, timings).map(Duration::from_millis),
    })
}

fn period_ms(id: TaskId, timings: &TaskTimings) -> Option<u64> {
    let ms = match id {
        TaskId::LinkCheck => timings.link_check_ms,
        TaskId::SessionCheck => timings.session_check_ms,
        TaskId::Telemetry => timings.telemetry_ms,
        TaskId::Attributes => timings.attributes_ms,
        TaskId::AttributeChanges => timings.attribute_changes_ms,
        TaskId::SessionPump => timings.session_pump_ms,
        TaskId::LightControl => timings.light_control_ms,
        TaskId::FanControl => timings.fan_control_ms,
        TaskId::Motion => timings.motion_ms,
        TaskId::Lcd => timings.lcd_ms,
        TaskId::DisplayCounter => timings.display_counter_ms,
        TaskId::DisplayRender => return None,
    };
    Some(ms)
}
