use super::executor::{Action, Job};
use super::ScheduleError;
use crate::detectors::TestType;
use chrono::{DateTime, Days, Months, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Daily,
    Weekly,
    Monthly,
    Bimonthly,
    Biannually,
    Annually,
}

impl Interval {
    /// Calendar step. Month steps clamp to the last day of a shorter month.
    pub fn add_to(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Interval::Daily => t.checked_add_days(Days::new(1)),
            Interval::Weekly => t.checked_add_days(Days::new(7)),
            Interval::Monthly => t.checked_add_months(Months::new(1)),
            Interval::Bimonthly => t.checked_add_months(Months::new(2)),
            Interval::Biannually => t.checked_add_months(Months::new(6)),
            Interval::Annually => t.checked_add_months(Months::new(12)),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Interval::Daily => "daily",
            Interval::Weekly => "weekly",
            Interval::Monthly => "monthly",
            Interval::Bimonthly => "bimonthly",
            Interval::Biannually => "biannually",
            Interval::Annually => "annually",
        };
        f.write_str(s)
    }
}

/// A schedulable unit. Exactly one of `test_type` and `chart_type` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_type: Option<TestType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_type: Option<String>,
    /// Only meaningful for chart tasks: set means a historic chart over that many days.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_days: Option<u32>,
    /// Next fire time.
    #[serde(rename = "datetime")]
    pub date_time: DateTime<Utc>,
    pub recurring: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<Interval>,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ran: Option<DateTime<Utc>>,
    pub created_on: DateTime<Utc>,
}

impl Task {
    fn new(name: &str, date_time: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            test_type: None,
            chart_type: None,
            recent_days: None,
            date_time: date_time.trunc_subsecs(0),
            recurring: false,
            interval: None,
            active: true,
            last_ran: None,
            created_on: Utc::now().trunc_subsecs(0),
        }
    }

    /// One-shot task triggering a probe.
    pub fn test(name: &str, test_type: TestType, date_time: DateTime<Utc>) -> Self {
        Self {
            test_type: Some(test_type),
            ..Self::new(name, date_time)
        }
    }

    /// One-shot task triggering chart generation; `recent_days` selects the historic chart.
    pub fn chart(
        name: &str,
        chart_type: &str,
        recent_days: Option<u32>,
        date_time: DateTime<Utc>,
    ) -> Self {
        Self {
            chart_type: Some(chart_type.to_string()),
            recent_days,
            ..Self::new(name, date_time)
        }
    }

    pub fn every(mut self, interval: Interval) -> Self {
        self.recurring = true;
        self.interval = Some(interval);
        self
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        let invalid = |reason: &str| ScheduleError::InvalidTask {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name cannot be empty"));
        }
        match (&self.test_type, &self.chart_type) {
            (Some(_), Some(_)) => return Err(invalid("test_type and chart_type are exclusive")),
            (None, None) => return Err(invalid("one of test_type or chart_type is required")),
            (None, Some(chart)) if chart.trim().is_empty() => {
                return Err(invalid("chart_type cannot be empty"))
            }
            _ => {}
        }
        if self.recurring && self.interval.is_none() {
            return Err(invalid("recurring task needs an interval"));
        }
        Ok(())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && self.date_time <= now
    }

    /// The request this task fires at `now`.
    pub(crate) fn job(&self, now: DateTime<Utc>) -> Option<Job> {
        let action = match (&self.test_type, &self.chart_type) {
            (Some(test), _) => Action::Test(*test),
            (None, Some(chart)) => match self.recent_days {
                Some(days) => Action::HistoricChart {
                    chart_type: chart.clone(),
                    days,
                },
                None => Action::Chart {
                    chart_type: chart.clone(),
                    date: now.date_naive(),
                },
            },
            (None, None) => return None,
        };
        Some(Job {
            task: self.name.clone(),
            action,
        })
    }

    /// Moves a fired task to its next state: recurring tasks step forward until
    /// they lie after `now`, one-shot tasks become inactive.
    pub fn reschedule(&mut self, now: DateTime<Utc>) {
        let interval = match (self.recurring, self.interval) {
            (true, Some(i)) => i,
            _ => {
                self.active = false;
                return;
            }
        };

        while self.date_time <= now {
            match interval.add_to(self.date_time) {
                Some(next) => self.date_time = next,
                None => {
                    warn!("Task {} next run time out of range, deactivate", self.name);
                    self.active = false;
                    return;
                }
            }
        }
    }
}

/// Replacement values for an existing task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskUpdate {
    /// Empty keeps the current name.
    pub name: String,
    pub test_type: Option<TestType>,
    pub chart_type: Option<String>,
    pub recent_days: Option<u32>,
    #[serde(rename = "datetime")]
    pub date_time: Option<DateTime<Utc>>,
    pub recurring: bool,
    pub interval: Option<Interval>,
    pub active: bool,
}

impl TaskUpdate {
    pub(crate) fn apply_to(self, task: &mut Task) {
        if !self.name.is_empty() {
            task.name = self.name;
        }
        task.recurring = self.recurring;
        task.active = self.active;
        task.interval = self.interval;

        if let Some(test) = self.test_type {
            task.test_type = Some(test);
            task.chart_type = None;
            task.recent_days = None;
        } else if let Some(chart) = self.chart_type {
            task.chart_type = Some(chart);
            task.test_type = None;
            task.recent_days = self.recent_days;
        }

        if let Some(date_time) = self.date_time {
            task.date_time = date_time.trunc_subsecs(0);
        }
    }
}
