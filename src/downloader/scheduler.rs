//! 队列调度窗口
//!
//! 按墙钟时间自动开启/停止队列。触发按分钟沿：同一分钟内只触发
//! 一次，避免 1 秒 tick 在整分钟里连发。窗口结束的动作只做建议，
//! 真正的挂机/退出/关机由宿主 UI 确认执行。

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

/// 窗口结束时的建议动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EndAction {
    #[default]
    None,
    /// 休眠
    HangUp,
    /// 退出应用
    ExitApp,
    /// 关机（宿主必须弹确认框）
    Shutdown,
}

/// 调度检查产生的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleEvent {
    StartQueue,
    StopQueue(EndAction),
}

/// 调度窗口
#[derive(Debug, Clone)]
pub struct Schedule {
    pub start_enabled: bool,
    pub start_at: NaiveTime,
    pub stop_enabled: bool,
    pub stop_at: NaiveTime,
    pub action: EndAction,
    /// 上次触发启动的分钟值（防止同分钟重复触发）
    last_start_minute: i32,
    last_stop_minute: i32,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            start_enabled: false,
            start_at: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            stop_enabled: false,
            stop_at: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            action: EndAction::None,
            last_start_minute: -1,
            last_stop_minute: -1,
        }
    }
}

impl Schedule {
    /// 设置窗口并复位触发标记
    pub fn configure(
        &mut self,
        start_enabled: bool,
        start_at: NaiveTime,
        stop_enabled: bool,
        stop_at: NaiveTime,
        action: EndAction,
    ) {
        self.start_enabled = start_enabled;
        self.start_at = start_at;
        self.stop_enabled = stop_enabled;
        self.stop_at = stop_at;
        self.action = action;
        self.last_start_minute = -1;
        self.last_stop_minute = -1;
    }

    /// 每秒 tick 调用一次
    ///
    /// 到达启动时刻且队列未运行 → StartQueue；到达停止时刻且队列
    /// 在运行 → StopQueue；每个分钟值只触发一次
    pub fn check(&mut self, now: NaiveTime, queue_running: bool) -> Option<ScheduleEvent> {
        let current_minute = (now.hour() * 60 + now.minute()) as i32;

        if self.start_enabled && !queue_running {
            let start_minute = (self.start_at.hour() * 60 + self.start_at.minute()) as i32;
            if current_minute == start_minute && self.last_start_minute != current_minute {
                self.last_start_minute = current_minute;
                return Some(ScheduleEvent::StartQueue);
            }
        }

        if self.stop_enabled && queue_running {
            let stop_minute = (self.stop_at.hour() * 60 + self.stop_at.minute()) as i32;
            if current_minute == stop_minute && self.last_stop_minute != current_minute {
                self.last_stop_minute = current_minute;
                return Some(ScheduleEvent::StopQueue(self.action));
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn test_start_trigger_once_per_minute() {
        let mut schedule = Schedule::default();
        schedule.configure(true, t(9, 30, 0), false, t(0, 0, 0), EndAction::None);

        // 第一次到达 9:30 触发
        assert_eq!(
            schedule.check(t(9, 30, 0), false),
            Some(ScheduleEvent::StartQueue)
        );
        // 同一分钟内后续 tick 不再触发
        assert_eq!(schedule.check(t(9, 30, 1), false), None);
        assert_eq!(schedule.check(t(9, 30, 59), false), None);
        // 其他时刻不触发
        assert_eq!(schedule.check(t(9, 31, 0), false), None);
    }

    #[test]
    fn test_stop_trigger_carries_action() {
        let mut schedule = Schedule::default();
        schedule.configure(false, t(0, 0, 0), true, t(23, 0, 0), EndAction::Shutdown);

        assert_eq!(schedule.check(t(22, 59, 59), true), None);
        assert_eq!(
            schedule.check(t(23, 0, 5), true),
            Some(ScheduleEvent::StopQueue(EndAction::Shutdown))
        );
        assert_eq!(schedule.check(t(23, 0, 6), true), None);
    }

    #[test]
    fn test_start_needs_queue_stopped() {
        let mut schedule = Schedule::default();
        schedule.configure(true, t(8, 0, 0), false, t(0, 0, 0), EndAction::None);

        // 队列已经在运行时不触发启动
        assert_eq!(schedule.check(t(8, 0, 0), true), None);
    }

    #[test]
    fn test_reconfigure_resets_edge() {
        let mut schedule = Schedule::default();
        schedule.configure(true, t(9, 0, 0), false, t(0, 0, 0), EndAction::None);
        assert!(schedule.check(t(9, 0, 0), false).is_some());
        assert!(schedule.check(t(9, 0, 30), false).is_none());

        // 重新配置后同一分钟可以再次触发
        schedule.configure(true, t(9, 0, 0), false, t(0, 0, 0), EndAction::None);
        assert!(schedule.check(t(9, 0, 45), false).is_some());
    }
}
