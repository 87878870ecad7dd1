use embassy_time::Duration;

/// Hard upper bound for a single PDP activation.
pub fn connect_timeout() -> Duration {
    Duration::from_secs(180)
}

/// Budget the activating state gives the radio before treating the attempt as
/// failed. Kept below [`connect_timeout`] so the local timeout always wins.
pub fn connect_task_timeout() -> Duration {
    Duration::from_secs(170)
}

/// Time to wait for a deactivate confirmation.
pub fn disconnect_timeout() -> Duration {
    Duration::from_secs(90)
}

/// Replacement disconnect deadline once the interface reports link down.
pub fn link_down_disconnect_delay() -> Duration {
    Duration::from_millis(1000)
}

/// Delay before data is permitted again after a radio-side data block.
pub fn resume_data_permitted_delay() -> Duration {
    Duration::from_secs(30)
}

/// Stall detection cadence while the screen is on.
pub fn stall_detection_aggressive() -> Duration {
    Duration::from_secs(10)
}

/// Stall detection cadence while the screen is off.
pub fn stall_detection_passive() -> Duration {
    Duration::from_secs(600)
}

/// Traffic polling cadence for the data flow type.
pub fn flow_poll_interval() -> Duration {
    Duration::from_secs(1)
}

/// Wait between recovery stages, so the previous stage gets a chance.
pub fn recovery_stage_interval() -> Duration {
    Duration::from_secs(60)
}
