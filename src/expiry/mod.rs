//! The expiry scheduler (C8, §4.7): a 60-second tick that tears down
//! reservations past their deadline, sends graduated time-remaining
//! warnings, and sweeps reservations stuck in an early transient state
//! for too long.

use tracing::warn;

use crate::context::AppContext;
use crate::db::models::Reservation;
use crate::error::{CoreError, CoreResult};
use crate::notify::NotificationChannel;
use crate::teardown;

const STALE_PENDING_MAX_AGE: chrono::Duration = chrono::Duration::days(7);
const EXPIRED_BATCH_SIZE: i64 = 50;

/// One of the three graduated warning thresholds, checked in descending
/// order so a reservation that skips straight into the `(0,5]` window
/// (e.g. a tick that was delayed) still gets exactly one warning, not
/// three.
const WARNING_WINDOWS: &[(i32, i64, i64)] = &[(30, 25, 30), (15, 10, 15), (5, 0, 5)];

/// One tick: teardown anything past `expires_at`, send any warning whose
/// window the reservation has just entered, and fail anything that has
/// sat in an early transient status past the stale-pending ceiling.
pub async fn tick_expiry(ctx: &AppContext) -> CoreResult<()> {
    teardown_expired(ctx).await?;
    send_warnings(ctx).await?;
    sweep_stale_pending(ctx).await?;
    Ok(())
}

async fn teardown_expired(ctx: &AppContext) -> CoreResult<()> {
    let expired = ctx.db.list_expired(EXPIRED_BATCH_SIZE).await.map_err(CoreError::Internal)?;
    for reservation in expired {
        teardown::teardown(ctx, &reservation, "completed", Some("expired")).await;
    }
    Ok(())
}

/// Scans every non-terminal, launched reservation and sends the warning
/// whose window it has just entered, if any.
async fn send_warnings(ctx: &AppContext) -> CoreResult<()> {
    let reservations = ctx.db.list_launched_non_terminal().await.map_err(CoreError::Internal)?;

    for reservation in reservations {
        let Some(expires_at) = reservation.expires_at else { continue };
        let minutes_remaining = (expires_at - chrono::Utc::now()).num_minutes();

        for &(threshold, lower, upper) in WARNING_WINDOWS {
            if minutes_remaining > upper || minutes_remaining <= lower {
                continue;
            }
            if already_warned(&reservation, threshold) {
                continue;
            }

            let message = format!("reservation {} expires in {threshold} minutes", reservation.reservation_id);
            ctx.notifier
                .notify(
                    &reservation.user_id,
                    NotificationChannel::ExpiryWarning,
                    &message,
                    serde_json::json!({
                        "reservation_id": reservation.reservation_id,
                        "minutes_remaining": minutes_remaining,
                        "threshold": threshold,
                    }),
                )
                .await;

            if let Err(e) = ctx.db.mark_warned(reservation.reservation_id, threshold).await {
                warn!(reservation_id = %reservation.reservation_id, error = %e, "failed to record expiry warning");
            }
            break;
        }
    }

    Ok(())
}

fn already_warned(reservation: &Reservation, threshold: i32) -> bool {
    match threshold {
        30 => reservation.warned_30,
        15 => reservation.warned_15,
        5 => reservation.warned_5,
        _ => true,
    }
}

async fn sweep_stale_pending(ctx: &AppContext) -> CoreResult<()> {
    let stale = ctx
        .db
        .list_stale_pending(STALE_PENDING_MAX_AGE)
        .await
        .map_err(CoreError::Internal)?;

    for reservation in stale {
        if let Err(e) = ctx
            .db
            .update_status(reservation.reservation_id, "failed", Some("stuck past the 7-day ceiling"), Some("stale"))
            .await
        {
            warn!(reservation_id = %reservation.reservation_id, error = %e, "failed to fail stale-pending reservation");
            continue;
        }

        if let Some(disk_name) = &reservation.disk_name {
            let _ = ctx.db.set_disk_attachment(&reservation.user_id, disk_name, None).await;
        }

        if reservation.is_multinode {
            let master_id = reservation.master_reservation_id.unwrap_or(reservation.reservation_id);
            crate::multinode::cascade_terminal(ctx, master_id, reservation.reservation_id).await;
        }
    }

    ctx.emit(crate::context::ChangeEvent::ReservationChanged);
    Ok(())
}
