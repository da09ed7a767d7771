//! Database-backed availability: loads shifts, active bookings and service
//! durations for one business day and runs the slot scan over them.

use chrono::NaiveDate;

use super::{
    available_slots, first_conflict, fits_in_shifts, format_hhmm, minutes_of_day, parse_date,
    parse_hhmm, weekday_index, BusinessClock, BusyInterval, SchedulingError, Shift, SlotQuery,
    MINUTES_PER_DAY,
};
use crate::config::SchedulingConfig;
use crate::db::Service;
use crate::DbPool;

/// Slots offered for one day
#[derive(Debug, Clone)]
pub struct DayAvailability {
    pub date: NaiveDate,
    pub duration: u32,
    pub times: Vec<u32>,
}

impl DayAvailability {
    pub fn formatted_times(&self) -> Vec<String> {
        self.times.iter().map(|&m| format_hhmm(m)).collect()
    }
}

/// A validated booking request slot
#[derive(Debug, Clone)]
pub struct BookingSlot {
    pub date: NaiveDate,
    pub start: u32,
    pub duration: u32,
}

pub struct Scheduler<'a> {
    db: &'a DbPool,
    config: &'a SchedulingConfig,
    clock: BusinessClock,
}

impl<'a> Scheduler<'a> {
    pub fn new(db: &'a DbPool, config: &'a SchedulingConfig) -> Self {
        Self {
            db,
            config,
            clock: BusinessClock::new(config.utc_offset_minutes),
        }
    }

    pub fn clock(&self) -> BusinessClock {
        self.clock
    }

    /// Shifts configured for the weekday of `date`; unparseable rows are skipped
    pub async fn load_shifts(&self, user_id: &str, date: NaiveDate) -> Result<Vec<Shift>, SchedulingError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT start_time, end_time FROM work_shifts WHERE user_id = ? AND weekday = ? ORDER BY start_time",
        )
        .bind(user_id)
        .bind(weekday_index(date))
        .fetch_all(self.db)
        .await?;

        let mut shifts = Vec::with_capacity(rows.len());
        for (start, end) in rows {
            match Shift::parse(&start, &end) {
                Ok(shift) => shifts.push(shift),
                Err(e) => tracing::warn!(user_id = %user_id, error = %e, "Skipping invalid work shift"),
            }
        }
        Ok(shifts)
    }

    /// Active bookings of the day as busy intervals
    pub async fn load_busy(&self, user_id: &str, date: NaiveDate) -> Result<Vec<BusyInterval>, SchedulingError> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT id, start_time, duration_minutes FROM bookings WHERE user_id = ? AND date = ? AND status = 'active'",
        )
        .bind(user_id)
        .bind(date.format("%Y-%m-%d").to_string())
        .fetch_all(self.db)
        .await?;

        let mut busy = Vec::with_capacity(rows.len());
        for (id, start_time, duration) in rows {
            match parse_hhmm(&start_time) {
                Ok(start) => busy.push(BusyInterval {
                    start,
                    duration: duration.max(0) as u32,
                    id,
                }),
                Err(e) => tracing::warn!(booking_id = %id, error = %e, "Skipping booking with invalid start time"),
            }
        }
        Ok(busy)
    }

    /// Active services of the owner matching `service_ids`, in request order
    pub async fn load_services(
        &self,
        user_id: &str,
        service_ids: &[String],
    ) -> Result<Vec<Service>, SchedulingError> {
        let mut services = Vec::with_capacity(service_ids.len());
        for id in service_ids {
            let service: Option<Service> = sqlx::query_as(
                "SELECT * FROM services WHERE id = ? AND user_id = ? AND is_active = 1",
            )
            .bind(id)
            .bind(user_id)
            .fetch_optional(self.db)
            .await?;
            services.push(service.ok_or_else(|| SchedulingError::UnknownService(id.clone()))?);
        }
        Ok(services)
    }

    /// Total duration of the selected services, one slot when none are selected
    pub fn duration_of(&self, services: &[Service]) -> u32 {
        let total: i64 = services.iter().map(|s| s.duration_minutes.max(0)).sum();
        if total == 0 {
            self.config.slot_minutes
        } else {
            total as u32
        }
    }

    /// Today's local minute when `date` is today, error when outside the booking window
    fn check_day(&self, date: NaiveDate) -> Result<Option<u32>, SchedulingError> {
        let now = self.clock.now_local();
        let today = now.date();
        if date < today {
            return Err(SchedulingError::PastDate);
        }
        if (date - today).num_days() > self.config.booking_horizon_days {
            return Err(SchedulingError::BeyondHorizon(self.config.booking_horizon_days));
        }
        Ok((date == today).then(|| minutes_of_day(now)))
    }

    pub async fn available(
        &self,
        user_id: &str,
        date: &str,
        service_ids: &[String],
    ) -> Result<DayAvailability, SchedulingError> {
        let date = parse_date(date)?;
        let services = self.load_services(user_id, service_ids).await?;
        let duration = self.duration_of(&services);

        let now_minutes = match self.check_day(date) {
            Ok(now) => now,
            Err(SchedulingError::PastDate) => {
                return Ok(DayAvailability {
                    date,
                    duration,
                    times: Vec::new(),
                })
            }
            Err(e) => return Err(e),
        };

        let shifts = self.load_shifts(user_id, date).await?;
        let busy = self.load_busy(user_id, date).await?;
        let times = available_slots(&SlotQuery {
            shifts: &shifts,
            busy: &busy,
            slot_minutes: self.config.slot_minutes,
            duration,
            now_minutes,
        });

        Ok(DayAvailability {
            date,
            duration,
            times,
        })
    }

    /// Validate a booking time against the calendar, working hours and other bookings.
    ///
    /// `exclude_booking` is the booking being rescheduled. Owners may book outside
    /// working hours; customers through the public link may not.
    pub async fn check_booking(
        &self,
        user_id: &str,
        date: &str,
        start_time: &str,
        duration: u32,
        exclude_booking: Option<&str>,
        require_shift: bool,
    ) -> Result<BookingSlot, SchedulingError> {
        let date = parse_date(date)?;
        let start = parse_hhmm(start_time)?;
        if duration == 0 || start + duration > MINUTES_PER_DAY {
            return Err(SchedulingError::InvalidDuration);
        }

        if let Some(now) = self.check_day(date)? {
            if start <= now {
                return Err(SchedulingError::InPast);
            }
        }

        if require_shift {
            let shifts = self.load_shifts(user_id, date).await?;
            if !fits_in_shifts(&shifts, start, duration) {
                return Err(SchedulingError::OutsideWorkingHours);
            }
        }

        let busy = self.load_busy(user_id, date).await?;
        if let Some(conflict) = first_conflict(&busy, start, duration, exclude_booking) {
            return Err(SchedulingError::Conflict(format_hhmm(conflict.start)));
        }

        Ok(BookingSlot {
            date,
            start,
            duration,
        })
    }
}
