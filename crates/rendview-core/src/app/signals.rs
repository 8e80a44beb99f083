//! Signals - OS シグナルの転送
//!
//! シグナルを [`Control`] メッセージに変換するだけ。エスカレーションの判断は
//! manager 側で行う。

use nix::sys::signal::Signal;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::debug;

use super::manager::Control;

/// Listen for SIGINT, SIGTERM, SIGTSTP and SIGCONT until the manager goes away.
pub async fn forward_signals(tx: mpsc::UnboundedSender<Control>) -> std::io::Result<()> {
    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut tstp = signal(SignalKind::from_raw(Signal::SIGTSTP as i32))?;
    let mut cont = signal(SignalKind::from_raw(Signal::SIGCONT as i32))?;

    loop {
        let control = tokio::select! {
            Some(()) = int.recv() => Control::Interrupt,
            Some(()) = term.recv() => Control::Terminate,
            Some(()) = tstp.recv() => Control::Stop,
            Some(()) = cont.recv() => Control::Continue,
            else => break,
        };
        debug!(?control, "signal received");
        if tx.send(control).is_err() {
            break;
        }
    }
    debug!("signal forwarding stopped");
    Ok(())
}
