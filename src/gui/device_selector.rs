use std::{
    io::stdout,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::gui::error::RangerGuiError;

use crossterm::{
    event::{self, KeyCode, KeyEventKind},
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

/// Name prefixes of the USB CDC ACM and USB serial bridges the radio
/// boards enumerate as.
const USB_BRIDGE_PREFIXES: [&str; 4] = ["ttyACM", "ttyUSB", "cu.usbmodem", "cu.usbserial"];

/// Whether `port` looks like a USB serial bridge, which is how the radio
/// boards show up. Built-in UARTs never are.
pub fn is_usb_bridge(port: &Path) -> bool {
    port.file_name()
        .and_then(|name| name.to_str())
        .map_or(false, |name| {
            USB_BRIDGE_PREFIXES
                .iter()
                .any(|prefix| name.starts_with(prefix))
        })
}

/// One line of the picker.
fn port_label(port: &Path) -> String {
    if is_usb_bridge(port) {
        format!("{}  (USB bridge)", port.display())
    } else {
        port.display().to_string()
    }
}

/// Let the user pick one of `available_ports` with the arrow keys. USB
/// bridges are listed first. Returns `None` if they quit without choosing
/// or there was nothing to choose.
pub fn device_selector(
    mut available_ports: Vec<PathBuf>,
) -> Result<Option<PathBuf>, RangerGuiError> {
    if available_ports.is_empty() {
        return Ok(None);
    }
    // stable, so ports keep their order within each group
    available_ports.sort_by_key(|port| !is_usb_bridge(port));

    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let selected_port = select_loop(&available_ports);
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    Ok(selected_port?.map(|i| available_ports.swap_remove(i)))
}

fn select_loop(available_ports: &[PathBuf]) -> Result<Option<usize>, RangerGuiError> {
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let mut cursor = 0;
    let mut list_state = ListState::default().with_selected(Some(cursor));
    let n_ports = available_ports.len();
    let labels: Vec<String> = available_ports.iter().map(|p| port_label(p)).collect();
    loop {
        let title = Title::from(" Select the UWB radio ".magenta().bold());
        let instructions = Title::from(Line::from(vec![
            " Navigate ".into(),
            "<Up>/<Down>".magenta().bold(),
            " Select ".into(),
            "<Enter>".magenta().bold(),
            " Quit ".into(),
            "<Q> ".magenta().bold(),
        ]));
        let block = Block::default()
            .title(title.alignment(Alignment::Center))
            .title(
                instructions
                    .alignment(Alignment::Center)
                    .position(Position::Bottom),
            )
            .borders(Borders::ALL);
        let list = List::new(labels.iter().map(String::as_str))
            .style(Style::default().fg(Color::White))
            .highlight_symbol(">>")
            .highlight_style(Style::default().fg(Color::Magenta))
            .block(block);
        list_state.select(Some(cursor));
        terminal.draw(|frame| {
            let area = frame.size();
            frame.render_stateful_widget(list, area, &mut list_state);
        })?;

        if event::poll(Duration::from_millis(16))? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Down => cursor = (cursor + 1) % n_ports,
                        KeyCode::Up => cursor = (cursor + n_ports - 1) % n_ports,
                        KeyCode::Enter => return Ok(Some(cursor)),
                        KeyCode::Char('q') | KeyCode::Esc => return Ok(None),
                        _ => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_bridges_are_recognised() {
        assert!(is_usb_bridge(Path::new("/dev/ttyACM0")));
        assert!(is_usb_bridge(Path::new("/dev/ttyUSB3")));
        assert!(is_usb_bridge(Path::new("/dev/cu.usbmodem14101")));
        assert!(!is_usb_bridge(Path::new("/dev/ttyS0")));
        assert!(!is_usb_bridge(Path::new("COM3")));
    }

    #[test]
    fn labels_mark_bridges() {
        assert_eq!(port_label(Path::new("/dev/ttyACM0")), "/dev/ttyACM0  (USB bridge)");
        assert_eq!(port_label(Path::new("/dev/ttyS0")), "/dev/ttyS0");
    }
}
