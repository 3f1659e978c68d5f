// SPDX-License-Identifier: MPL-2.0

//! Screen power broadcasts.
//!
//! The daemon learns about the display going to sleep through signals, which
//! an idle manager sends, e.g.
//! `swayidle timeout 300 'pkill -USR1 video-wallpaper' resume 'pkill -USR2 video-wallpaper'`.

use calloop::signals::Signal;

/// Signals the daemon listens to.
pub const SIGNALS: [Signal; 4] = [
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGINT,
    Signal::SIGTERM,
];

/// What a received broadcast means for the engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    ScreenPower { screen_is_off: bool },
    Shutdown,
    Ignored,
}

/// Translates broadcasts into the `screen_is_off` power command.
#[derive(Debug, Default)]
pub struct PowerStateMonitor {
    screen_is_off: Option<bool>,
}

impl PowerStateMonitor {
    /// Last forwarded screen state, if any broadcast arrived yet.
    #[must_use]
    pub fn screen_is_off(&self) -> Option<bool> {
        self.screen_is_off
    }

    pub fn on_screen_off(&mut self) -> PowerEvent {
        self.forward(true)
    }

    pub fn on_screen_on(&mut self) -> PowerEvent {
        self.forward(false)
    }

    /// Translate a received signal. Unexpected ones are logged and ignored.
    pub fn on_signal(&mut self, signal: Signal) -> PowerEvent {
        match signal {
            Signal::SIGUSR1 => self.on_screen_off(),
            Signal::SIGUSR2 => self.on_screen_on(),
            Signal::SIGINT | Signal::SIGTERM => {
                tracing::info!(?signal, "shutting down");
                PowerEvent::Shutdown
            }
            other => {
                tracing::warn!(signal = ?other, "ignoring unexpected broadcast");
                PowerEvent::Ignored
            }
        }
    }

    fn forward(&mut self, screen_is_off: bool) -> PowerEvent {
        tracing::info!(screen_is_off, "screen power changed");
        self.screen_is_off = Some(screen_is_off);
        PowerEvent::ScreenPower { screen_is_off }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_signals_carry_screen_power() {
        let mut monitor = PowerStateMonitor::default();
        assert_eq!(monitor.screen_is_off(), None);

        assert_eq!(
            monitor.on_signal(Signal::SIGUSR1),
            PowerEvent::ScreenPower { screen_is_off: true }
        );
        assert_eq!(monitor.screen_is_off(), Some(true));

        assert_eq!(
            monitor.on_signal(Signal::SIGUSR2),
            PowerEvent::ScreenPower { screen_is_off: false }
        );
        assert_eq!(monitor.screen_is_off(), Some(false));
    }

    #[test]
    fn termination_signals_shut_down() {
        let mut monitor = PowerStateMonitor::default();
        assert_eq!(monitor.on_signal(Signal::SIGTERM), PowerEvent::Shutdown);
        assert_eq!(monitor.on_signal(Signal::SIGINT), PowerEvent::Shutdown);
        assert_eq!(monitor.screen_is_off(), None);
    }

    #[test]
    fn unexpected_signals_are_ignored() {
        let mut monitor = PowerStateMonitor::default();
        monitor.on_screen_off();
        assert_eq!(monitor.on_signal(Signal::SIGHUP), PowerEvent::Ignored);
        assert_eq!(monitor.screen_is_off(), Some(true));
    }
}
