//! Motion task bodies
//!
//! Each function here runs on the motion executor's worker and is the only
//! code that commands the axes. Every task is handed the epoch it was
//! submitted in (usually inside a [`MotionGuard`]) and re-checks it at each
//! wait, so an abort takes effect at the next poll.

use crate::config::{save_park_position, TelescopeConfig};
use crate::coords::{
    hour_angle, local_sidereal_time, normalize_degrees_signed, normalize_hours, Clock,
};
use crate::error::{MountError, MountResult};
use crate::guard::MotionGuard;
use crate::state::{GuideDirection, MotionKind, ParkPosition, PierSide, SharedState, TelescopeAxis};
use crate::telescope::MountAxes;
use crate::wait::sleep_cancellable;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Granularity of cancellable sleeps (settle time, pulse guides)
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Everything a motion task needs, cheap to clone into each task
#[derive(Clone)]
pub(crate) struct MotionContext {
    pub state: SharedState,
    pub axes: MountAxes,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<TelescopeConfig>,
    pub config_path: Option<PathBuf>,
}

impl MotionContext {
    fn lst(&self) -> f64 {
        let longitude = self.state.with(|s| s.site.longitude);
        local_sidereal_time(self.clock.now(), longitude)
    }

    /// Tracking rate currently selected, in RA axis degrees/second
    fn tracking_rate(&self) -> f64 {
        let rate = self.state.with(|s| s.tracking_rate);
        self.config.tracking_rates.degrees_per_sec(rate)
    }

    /// Pulse targets for both axes that point at `ra`/`dec` right now
    pub fn axis_targets(&self, ra: f64, dec: f64) -> (i32, i32) {
        let park = self.state.with(|s| s.park);
        let ha = hour_angle(ra, self.lst());
        let ra_degrees = normalize_degrees_signed((ha - park.hour_angle) * 15.0);
        let dec_degrees = dec - park.declination;
        (
            self.axes.ra.geometry().degrees_to_pulses(ra_degrees),
            self.axes.dec.geometry().degrees_to_pulses(dec_degrees),
        )
    }

    /// Pointing derived from both pulse counts
    pub async fn read_position(&self) -> MountResult<(f64, f64)> {
        let ra_degrees = self.axes.ra.read_degrees().await?;
        let dec_degrees = self.axes.dec.read_degrees().await?;
        let park = self.state.with(|s| s.park);
        let ha = park.hour_angle + ra_degrees / 15.0;
        Ok((
            normalize_hours(self.lst() - ha),
            (park.declination + dec_degrees).clamp(-90.0, 90.0),
        ))
    }

    /// Drive the RA axis at the tracking rate if tracking is on for `epoch`
    async fn restart_tracking(&self, epoch: u64) -> MountResult<()> {
        if !self.state.with(|s| s.is_current(epoch) && s.tracking) {
            return Ok(());
        }
        let rate = self.tracking_rate();
        debug!("Tracking at {:.6} deg/s", rate);
        if let Err(e) = self.axes.ra.run_at_rate(rate).await {
            self.state.with_mut(|s| {
                if s.is_current(epoch) {
                    s.set_tracking(false);
                }
            });
            return Err(e.into());
        }
        Ok(())
    }

    // =========================================================================
    // TASKS
    // =========================================================================

    /// Both axes are commanded first and then waited on, so they move
    /// together
    pub async fn slew(self, guard: MotionGuard, ra: f64, dec: f64) -> MountResult<()> {
        let cancelled = guard.cancel_check();
        let epoch = guard.epoch();
        let (ra_target, dec_target) = self.axis_targets(ra, dec);
        info!(
            "Slewing to RA {:.4}h DEC {:+.4}° (pulses {}, {})",
            ra, dec, ra_target, dec_target
        );

        let (ra_axis, dec_axis) = (&self.axes.ra, &self.axes.dec);
        ra_axis.stop().await?;
        if cancelled() {
            return Ok(());
        }
        ra_axis
            .begin_move_to(ra_target, self.config.axes.ra.slew_rate)
            .await?;
        dec_axis
            .begin_move_to(dec_target, self.config.axes.dec.slew_rate)
            .await?;

        if !ra_axis.wait_for_target(ra_target, &cancelled).await?.is_done()
            || !dec_axis.wait_for_target(dec_target, &cancelled).await?.is_done()
        {
            debug!("Slew to RA {:.4}h DEC {:+.4}° aborted", ra, dec);
            return Ok(());
        }

        let settle = self.state.with(|s| s.slew_settle_time);
        if settle > 0.0 {
            let outcome =
                sleep_cancellable(Duration::from_secs_f64(settle), SLEEP_SLICE, &cancelled).await;
            if !outcome.is_done() {
                return Ok(());
            }
        }

        let lst = self.lst();
        match guard.complete(|s| {
            s.set_position(ra, dec);
            s.set_side_of_pier(PierSide::from_hour_angle(hour_angle(ra, lst)));
        }) {
            Some(resume) => {
                info!("Slew complete");
                if resume {
                    self.restart_tracking(epoch).await?;
                }
            }
            None => debug!("Slew finished after an abort, state left alone"),
        }
        Ok(())
    }

    pub async fn park(self, guard: MotionGuard) -> MountResult<()> {
        let cancelled = guard.cancel_check();
        info!("Parking");

        let (ra_axis, dec_axis) = (&self.axes.ra, &self.axes.dec);
        ra_axis.stop().await?;
        if cancelled() {
            return Ok(());
        }
        ra_axis
            .begin_return_to_zero(self.config.axes.ra.slew_rate)
            .await?;
        dec_axis
            .begin_return_to_zero(self.config.axes.dec.slew_rate)
            .await?;

        if !ra_axis.wait_for_target(0, &cancelled).await?.is_done()
            || !dec_axis.wait_for_target(0, &cancelled).await?.is_done()
        {
            return Ok(());
        }

        let lst = self.lst();
        if guard
            .complete(|s| {
                let park = s.park;
                s.set_position(lst - park.hour_angle, park.declination);
                s.set_side_of_pier(PierSide::from_hour_angle(park.hour_angle));
                s.set_at_park(true);
            })
            .is_some()
        {
            info!("Parked");
        }
        Ok(())
    }

    /// Axes home one after the other, with an abort check in between
    pub async fn find_home(self, guard: MotionGuard) -> MountResult<()> {
        let cancelled = guard.cancel_check();
        info!("Searching for home");

        self.axes.ra.stop().await?;
        for axis in [&self.axes.ra, &self.axes.dec] {
            if cancelled() || !axis.find_home(&cancelled).await?.is_done() {
                return Ok(());
            }
        }

        let (ra, dec) = self.read_position().await?;
        let lst = self.lst();
        if guard
            .complete(|s| {
                s.set_position(ra, dec);
                s.set_side_of_pier(PierSide::from_hour_angle(hour_angle(ra, lst)));
                s.set_at_home(true);
            })
            .is_some()
        {
            info!("At home (RA {:.4}h DEC {:+.4}°)", ra, dec);
        }
        Ok(())
    }

    /// Make the current pointing the park position and persist it
    pub async fn set_park(self, epoch: u64) -> MountResult<()> {
        if !self.state.with(|s| s.is_current(epoch)) {
            return Ok(());
        }
        self.axes.ra.set_zero().await?;
        self.axes.dec.set_zero().await?;

        let lst = self.lst();
        let park = self.state.with_mut(|s| {
            if !s.is_current(epoch) {
                return None;
            }
            let park = ParkPosition {
                hour_angle: hour_angle(s.right_ascension, lst),
                declination: s.declination,
            };
            s.set_park(park);
            Some(park)
        });
        let Some(park) = park else {
            return Ok(());
        };
        info!(
            "Park position set to HA {:.4}h DEC {:+.4}°",
            park.hour_angle, park.declination
        );

        if let Some(path) = self.config_path.clone() {
            tokio::task::spawn_blocking(move || save_park_position(&path, park))
                .await
                .map_err(|e| MountError::Config(format!("park position save task failed: {}", e)))??;
        }
        Ok(())
    }

    /// Stop both axes, refresh the position from the pulse counts, and
    /// keep tracking running if it was on and nothing was moving
    pub async fn abort(self, epoch: u64) -> MountResult<()> {
        let mut first_error = None;
        for axis in [&self.axes.ra, &self.axes.dec] {
            if let Err(e) = axis.stop().await {
                warn!("Failed to stop {} axis: {}", axis.name(), e);
                first_error.get_or_insert(e);
            }
        }

        match self.read_position().await {
            Ok((ra, dec)) => {
                let lst = self.lst();
                self.state.with_mut(|s| {
                    if s.is_current(epoch) && !s.is_moving() {
                        s.set_position(ra, dec);
                        s.set_side_of_pier(PierSide::from_hour_angle(hour_angle(ra, lst)));
                    }
                });
            }
            Err(e) => warn!("Position unknown after abort: {}", e),
        }

        self.restart_tracking(epoch).await?;
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Apply one MoveAxis rate. The motion ends once every axis is at rest.
    pub async fn move_axis(
        self,
        guard: Option<MotionGuard>,
        epoch: u64,
        axis: TelescopeAxis,
        rate: f64,
    ) -> MountResult<()> {
        let drive = match axis {
            TelescopeAxis::Primary => &self.axes.ra,
            TelescopeAxis::Secondary => &self.axes.dec,
            TelescopeAxis::Tertiary => return Err(MountError::not_implemented("MoveAxis(tertiary)")),
        };
        if !self.state.with(|s| s.is_current(epoch)) {
            return Ok(());
        }
        debug!("MoveAxis {} at {} deg/s", axis, rate);
        if let Err(e) = drive.run_at_rate(rate).await {
            if guard.is_some() {
                // the guard drops armed below and ends the motion
                for other in [&self.axes.ra, &self.axes.dec] {
                    if let Err(stop_err) = other.stop().await {
                        warn!("Failed to stop {} axis: {}", other.name(), stop_err);
                    }
                }
            }
            return Err(e.into());
        }

        let at_rest = self.state.with(|s| {
            s.is_current(epoch) && s.motion == Some(MotionKind::MovingAxis) && s.axis_rates == [0.0; 2]
        });
        if !at_rest {
            if let Some(guard) = guard {
                guard.defuse();
            }
            return Ok(());
        }

        let (ra, dec) = self.read_position().await?;
        let lst = self.lst();
        let resume = self.state.with_mut(|s| {
            let still_at_rest = s.is_current(epoch)
                && s.motion == Some(MotionKind::MovingAxis)
                && s.axis_rates == [0.0; 2];
            if !still_at_rest {
                return None;
            }
            s.set_position(ra, dec);
            s.set_side_of_pier(PierSide::from_hour_angle(hour_angle(ra, lst)));
            Some(s.end_motion(epoch))
        });
        if let Some(guard) = guard {
            guard.defuse();
        }
        if resume == Some(true) {
            self.restart_tracking(epoch).await?;
        }
        Ok(())
    }

    /// Offset one axis at the guide rate for `duration`, then restore it
    pub async fn pulse_guide(
        self,
        guard: MotionGuard,
        direction: GuideDirection,
        duration: Duration,
    ) -> MountResult<()> {
        let cancelled = guard.cancel_check();
        let (tracking, guide_ra, guide_dec) = self.state.with(|s| {
            (
                s.tracking,
                s.guide_rate_right_ascension,
                s.guide_rate_declination,
            )
        });
        let tracking_rate = if tracking { self.tracking_rate() } else { 0.0 };
        debug!("Pulse guide {:?} for {:?}", direction, duration);

        // East raises RA, which means turning the RA axis against the sky
        if direction.is_declination() {
            self.axes.dec.run_at_rate(direction.sign() * guide_dec).await?;
        } else {
            self.axes
                .ra
                .run_at_rate(tracking_rate - direction.sign() * guide_ra)
                .await?;
        }

        let outcome = sleep_cancellable(duration, SLEEP_SLICE, &cancelled).await;
        if !outcome.is_done() {
            return Ok(());
        }

        if direction.is_declination() {
            self.axes.dec.stop().await?;
        } else {
            self.axes.ra.run_at_rate(tracking_rate).await?;
        }

        let seconds = duration.as_secs_f64();
        guard.complete(|s| {
            if direction.is_declination() {
                let dec = s.declination + direction.sign() * guide_dec * seconds;
                s.set_position(s.right_ascension, dec);
            } else {
                let ra = s.right_ascension + direction.sign() * guide_ra * seconds / 15.0;
                s.set_position(ra, s.declination);
            }
        });
        Ok(())
    }

    /// Start or stop the tracking drive
    pub async fn track(self, epoch: u64, enabled: bool) -> MountResult<()> {
        if !self.state.with(|s| s.is_current(epoch)) {
            return Ok(());
        }
        if enabled {
            self.restart_tracking(epoch).await
        } else {
            info!("Tracking stopped");
            Ok(self.axes.ra.stop().await?)
        }
    }
}
