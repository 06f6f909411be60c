use thiserror::Error;
use tracing::debug;
use winit::dpi::LogicalSize;
use winit::error::{EventLoopError, OsError};
use winit::event::{Event, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop, EventLoopBuilder, EventLoopProxy};
use winit::window::{Window, WindowBuilder, WindowId};

const TITLE: &str = "tdm";
const MIN_SIZE: f64 = 200.0;

#[derive(Debug, Error)]
pub enum WindowError {
    #[error("event loop error: {0}")]
    EventLoop(#[from] EventLoopError),
    #[error("window error: {0}")]
    Os(#[from] OsError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellEvent {
    StreamEnded,
}

/// Why [`WindowShell::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellExit {
    Closed,
    StreamEnded,
}

/// Wakes the event loop from another thread.
#[derive(Clone)]
pub struct ShellWaker {
    proxy: EventLoopProxy<ShellEvent>,
}

impl ShellWaker {
    pub fn stream_ended(&self) {
        if self.proxy.send_event(ShellEvent::StreamEnded).is_err() {
            debug!("window event loop already exited");
        }
    }
}

/// A single empty native window. Its only job is to keep the process in the
/// foreground until the user closes it or the stream dies.
pub struct WindowShell {
    event_loop: EventLoop<ShellEvent>,
    window: Window,
}

impl WindowShell {
    /// Must be called on the main thread.
    pub fn init() -> Result<Self, WindowError> {
        let event_loop = EventLoopBuilder::<ShellEvent>::with_user_event().build()?;
        let window = WindowBuilder::new()
            .with_title(TITLE)
            .with_min_inner_size(LogicalSize::new(MIN_SIZE, MIN_SIZE))
            .with_visible(true)
            .build(&event_loop)?;
        Ok(Self { event_loop, window })
    }

    pub fn waker(&self) -> ShellWaker {
        ShellWaker {
            proxy: self.event_loop.create_proxy(),
        }
    }

    /// Blocks until the window is closed or a waker reports the stream ended.
    pub fn run(self) -> Result<ShellExit, WindowError> {
        let Self { event_loop, window } = self;
        let id = window.id();
        let mut exit = ShellExit::Closed;
        event_loop.set_control_flow(ControlFlow::Wait);
        event_loop.run(|event, target| {
            if let Some(reason) = shell_exit(&event, id) {
                exit = reason;
                window.set_visible(false);
                target.exit();
            }
        })?;
        Ok(exit)
    }
}

fn shell_exit(event: &Event<ShellEvent>, id: WindowId) -> Option<ShellExit> {
    match event {
        Event::UserEvent(ShellEvent::StreamEnded) => Some(ShellExit::StreamEnded),
        Event::WindowEvent {
            window_id,
            event: WindowEvent::CloseRequested,
        } if *window_id == id => Some(ShellExit::Closed),
        _ => None,
    }
}
