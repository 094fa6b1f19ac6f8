use std::{
    fmt::Display,
    io::stdout,
    ops::ControlFlow,
    sync::mpsc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::gui::error::RangerGuiError;

use crossterm::{
    event::{self, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};

use ratatui::{
    prelude::*,
    widgets::{
        block::{Position, Title},
        *,
    },
    Terminal,
};

enum ThreadMessage {
    Stop,
}

/// Runs a function over and over on a worker thread, showing the state it
/// produces, until the user presses a key or the function breaks.
///
/// The function can be thought of as a recursive fold. `init` is the
/// initial state, `f` turns one state into the next, and each new state is
/// rendered with its [Display] impl. Returning [ControlFlow::Break] ends
/// the fold from the inside. The last state is returned either way.
pub fn fold_until_stop<F, T>(title: &str, init: T, mut f: F) -> Result<T, RangerGuiError>
where
    F: FnMut(T) -> ControlFlow<T, T> + Send + 'static,
    T: Display + Send + 'static,
{
    let (stop_tx, stop_rx) = mpsc::channel();
    let (view_tx, view_rx) = mpsc::channel();
    let (res_tx, res_rx) = mpsc::channel();

    let th = thread::spawn(move || {
        let mut val = init;
        loop {
            let (next, done) = match f(val) {
                ControlFlow::Continue(v) => (v, false),
                ControlFlow::Break(v) => (v, true),
            };
            val = next;
            let _ = view_tx.send(val.to_string());
            if done {
                break;
            }
            if let Ok(ThreadMessage::Stop) = stop_rx.try_recv() {
                break;
            }
        }
        let _ = res_tx.send(val);
    });

    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let drawn = draw_until_stop(title, &view_rx, &th);
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    // the worker may already be gone if it broke out on its own
    let _ = stop_tx.send(ThreadMessage::Stop);
    let res = res_rx.recv()?;
    th.join().map_err(|_| RangerGuiError::JoinError)?;
    drawn?;

    Ok(res)
}

fn draw_until_stop(
    title: &str,
    view_rx: &mpsc::Receiver<String>,
    th: &JoinHandle<()>,
) -> Result<(), RangerGuiError> {
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let mut view = String::new();
    loop {
        if let Some(latest) = view_rx.try_iter().last() {
            view = latest;
        }

        let heading = Title::from(Span::from(format!(" {} ", title)).magenta().bold());
        let instructions = Title::from(Line::from(vec![
            " Press any key to stop ".into(),
        ]));
        let block = Block::default()
            .title(heading.alignment(Alignment::Center))
            .title(
                instructions
                    .alignment(Alignment::Center)
                    .position(Position::Bottom),
            )
            .borders(Borders::ALL);
        let text = Paragraph::new(view.as_str()).block(block);
        terminal.draw(|frame| {
            let area = frame.size();
            frame.render_widget(text, area);
        })?;

        if th.is_finished() {
            return Ok(());
        }
        if event::poll(Duration::from_millis(16))? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    return Ok(());
                }
            }
        }
    }
}
