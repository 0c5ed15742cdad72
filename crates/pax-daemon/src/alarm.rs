//! Wake-up alarm: compute the next wall-clock occurrence of HH:MM and deliver
//! a one-shot event into the daemon loop when it arrives.

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Utc};
use pax_proto::protocol::{AlarmSetting, Station};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::DaemonEvent;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AlarmPayload {
    pub station_id: String,
    pub station_name: String,
    pub stream_url: String,
}

impl AlarmPayload {
    pub fn for_station(station: &Station) -> Self {
        Self {
            station_id: station.id.clone(),
            station_name: station.name.clone(),
            stream_url: station.stream_url.clone(),
        }
    }
}

impl From<&AlarmSetting> for AlarmPayload {
    fn from(setting: &AlarmSetting) -> Self {
        Self {
            station_id: setting.station_id.clone(),
            station_name: setting.station_name.clone(),
            stream_url: setting.stream_url.clone(),
        }
    }
}

/// Platform scheduler seam.  Scheduling replaces any pending alarm.
pub trait AlarmBridge: Send + Sync {
    fn schedule_one_shot(&mut self, epoch_ms: i64, payload: AlarmPayload);
    fn cancel(&mut self);
}

/// In-process scheduler: a sleeping task per pending alarm.  Alarms do not
/// survive the daemon; the controller reschedules persisted ones on start.
pub struct TokioAlarmBridge {
    event_tx: mpsc::Sender<DaemonEvent>,
    task: Option<JoinHandle<()>>,
}

impl TokioAlarmBridge {
    pub fn new(event_tx: mpsc::Sender<DaemonEvent>) -> Self {
        Self {
            event_tx,
            task: None,
        }
    }
}

impl AlarmBridge for TokioAlarmBridge {
    fn schedule_one_shot(&mut self, epoch_ms: i64, payload: AlarmPayload) {
        self.cancel();
        let delay_ms = (epoch_ms - Utc::now().timestamp_millis()).max(0) as u64;
        debug!("alarm: {} fires in {} ms", payload.station_id, delay_ms);

        let tx = self.event_tx.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            if tx.send(DaemonEvent::AlarmFired(payload)).await.is_err() {
                warn!("alarm: daemon loop gone");
            }
        }));
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for TokioAlarmBridge {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Next time the wall clock in `now`'s zone reads `hour:minute`.  An HH:MM at
/// or before `now` rolls to tomorrow.  `None` for an invalid time of day, or
/// when the local time does not exist (DST gap).
pub fn next_occurrence<Tz: TimeZone>(
    hour: u32,
    minute: u32,
    now: &DateTime<Tz>,
) -> Option<DateTime<Tz>> {
    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
    let tz = now.timezone();
    let today = now.date_naive().and_time(time);
    let candidate = tz.from_local_datetime(&today).earliest()?;
    if candidate > *now {
        return Some(candidate);
    }
    let tomorrow = today + ChronoDuration::days(1);
    tz.from_local_datetime(&tomorrow).earliest()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    #[test]
    fn test_later_today() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 6, 0, 0).unwrap();
        let next = next_occurrence(7, 30, &now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 10, 7, 30, 0).unwrap());
    }

    #[test]
    fn test_same_minute_rolls_to_tomorrow() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 7, 30, 0).unwrap();
        let next = next_occurrence(7, 30, &now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 11, 7, 30, 0).unwrap());
    }

    #[test]
    fn test_uses_local_wall_clock() {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2024, 12, 31, 23, 0, 0).unwrap();
        let next = next_occurrence(6, 45, &now).unwrap();
        assert_eq!(next, tz.with_ymd_and_hms(2025, 1, 1, 6, 45, 0).unwrap());
        assert_eq!(next.with_timezone(&Utc).format("%H:%M").to_string(), "04:45");
    }

    #[test]
    fn test_invalid_time() {
        let now = Utc::now();
        assert!(next_occurrence(24, 0, &now).is_none());
        assert!(next_occurrence(7, 60, &now).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bridge_delivers_and_cancel_suppresses() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut bridge = TokioAlarmBridge::new(tx);
        let soon = Utc::now().timestamp_millis() + 1000;

        bridge.schedule_one_shot(
            soon,
            AlarmPayload {
                station_id: "a".into(),
                ..Default::default()
            },
        );
        bridge.cancel();
        bridge.schedule_one_shot(
            soon,
            AlarmPayload {
                station_id: "b".into(),
                ..Default::default()
            },
        );

        match rx.recv().await {
            Some(DaemonEvent::AlarmFired(p)) => assert_eq!(p.station_id, "b"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }
}
