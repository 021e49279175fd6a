//! UPDI activation strategies
//!
//! Parts whose UPDI pin has been refused to GPIO or RESET duty need a
//! high-voltage pulse on the pin before the PHY answers. The strategies
//! here run before the first SYNCH and differ in who cycles target power
//! and how the pulse is produced. `SimpleUnsafePulse` drives the pulse
//! with no power cycle at all and must only be used on HV-tolerant
//! boards.

use std::{thread::sleep, time::Duration};

use log::{debug, info, warn};
use strum::{Display, EnumString, VariantNames};

use crate::{error::Error, interface::UpdiPort};

/// How long target power is held off during a power cycle
const POWER_OFF_DELAY: Duration = Duration::from_millis(100);
/// Settle time after power returns, before the pulse
const POWER_ON_SETTLE: Duration = Duration::from_millis(10);
/// Width of the high-voltage pulse trigger on RTS
const PULSE_WIDTH: Duration = Duration::from_millis(1);
/// How long to wait for the user to cycle power
const USER_TOGGLE_WAIT: Duration = Duration::from_secs(2);

/// High-voltage activation mode, selected at session start
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString, VariantNames)]
#[strum(serialize_all = "lowercase")]
#[non_exhaustive]
pub enum HighVoltage {
    /// No high-voltage activation
    #[default]
    None,
    /// The tool cycles target power and pulses during power-up
    Tool,
    /// The user is prompted to cycle target power
    User,
    /// Pulse the UPDI pin directly, without a power cycle. Unsafe for
    /// boards that are not HV-tolerant.
    Unsafe,
}

/// Some strategy for applying the high-voltage pulse before first contact
pub trait ActivationStrategy {
    fn activate(&self, port: &mut dyn UpdiPort) -> Result<(), Error>;

    fn pulse(&self, port: &mut dyn UpdiPort) -> Result<(), Error> {
        debug!("Triggering HV pulse");
        port.set_rts(true)?;
        sleep(PULSE_WIDTH);
        port.set_rts(false)?;
        Ok(())
    }
}

/// Cycle target power through DTR, then pulse during power-up
#[derive(Debug, Clone, Copy)]
pub struct PowerToggleActivation;

impl ActivationStrategy for PowerToggleActivation {
    fn activate(&self, port: &mut dyn UpdiPort) -> Result<(), Error> {
        debug!("Using power-toggle activation");

        port.set_dtr(true)?; // target power off
        sleep(POWER_OFF_DELAY);
        port.set_dtr(false)?; // target power on
        sleep(POWER_ON_SETTLE);

        self.pulse(port)
    }
}

/// Ask the user to cycle power, then wait before first contact
#[derive(Debug, Clone, Copy)]
pub struct UserPowerToggleActivation;

impl ActivationStrategy for UserPowerToggleActivation {
    fn activate(&self, port: &mut dyn UpdiPort) -> Result<(), Error> {
        info!("Toggle power to the target now");
        sleep(USER_TOGGLE_WAIT);

        self.pulse(port)
    }
}

/// Pulse the UPDI pin without any power cycle
#[derive(Debug, Clone, Copy)]
pub struct SimpleUnsafePulseActivation;

impl ActivationStrategy for SimpleUnsafePulseActivation {
    fn activate(&self, port: &mut dyn UpdiPort) -> Result<(), Error> {
        warn!("Applying HV pulse without a power cycle; board must be HV-tolerant");

        self.pulse(port)
    }
}

/// Select the activation strategy for a mode, if any
pub fn strategy(mode: HighVoltage) -> Option<Box<dyn ActivationStrategy>> {
    match mode {
        HighVoltage::None => None,
        HighVoltage::Tool => Some(Box::new(PowerToggleActivation)),
        HighVoltage::User => Some(Box::new(UserPowerToggleActivation)),
        HighVoltage::Unsafe => Some(Box::new(SimpleUnsafePulseActivation)),
    }
}
