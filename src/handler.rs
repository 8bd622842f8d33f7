use anyhow::Result;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers, MouseEvent, MouseEventKind};
use tokio::sync::mpsc::UnboundedSender;

use crate::app::{App, InputMode};
use crate::tui::AppEvent;

/// Convert a character index to a byte index for UTF-8 safe string operations
fn char_to_byte_index(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

pub fn handle_event(app: &mut App, events: &UnboundedSender<AppEvent>, event: AppEvent) -> Result<()> {
    match event {
        AppEvent::Key(key) => handle_key(app, events, key),
        AppEvent::Mouse(mouse) => handle_mouse(app, mouse),
        AppEvent::Resize(_, _) => {}
        AppEvent::Tick => app.tick_animation(),
        AppEvent::Stream(stream_event) => app.apply_stream_event(stream_event),
    }
    Ok(())
}

fn handle_key(app: &mut App, events: &UnboundedSender<AppEvent>, key: KeyEvent) {
    // Global keys that work in any mode
    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
        app.should_quit = true;
        return;
    }

    match app.input_mode {
        InputMode::Normal => handle_normal_mode(app, key),
        InputMode::Editing => handle_editing_mode(app, events, key),
    }
}

fn handle_normal_mode(app: &mut App, key: KeyEvent) {
    match key.code {
        // Quit
        KeyCode::Char('q') => app.should_quit = true,

        // Back to the input line
        KeyCode::Char('i') | KeyCode::Char('/') | KeyCode::Tab => {
            app.input_mode = InputMode::Editing;
            app.cursor = app.input.chars().count();
        }

        // Dismiss a surfaced error
        KeyCode::Esc => {
            app.error = None;
        }

        // Transcript scrolling
        KeyCode::Char('j') | KeyCode::Down => app.scroll_down(),
        KeyCode::Char('k') | KeyCode::Up => app.scroll_up(),
        KeyCode::Char('d') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            app.scroll_half_page_down();
        }
        KeyCode::Char('u') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            app.scroll_half_page_up();
        }
        KeyCode::Char('g') => {
            app.scroll = 0;
            app.auto_scroll = false;
        }
        KeyCode::Char('G') => app.scroll_to_bottom(),

        _ => {}
    }
}

fn handle_editing_mode(app: &mut App, events: &UnboundedSender<AppEvent>, key: KeyEvent) {
    match key.code {
        KeyCode::Esc => {
            app.input_mode = InputMode::Normal;
        }
        KeyCode::Enter => {
            app.submit(events);
        }
        KeyCode::Backspace => {
            if app.cursor > 0 {
                app.cursor -= 1;
                let byte_pos = char_to_byte_index(&app.input, app.cursor);
                app.input.remove(byte_pos);
            }
        }
        KeyCode::Delete => {
            let char_count = app.input.chars().count();
            if app.cursor < char_count {
                let byte_pos = char_to_byte_index(&app.input, app.cursor);
                app.input.remove(byte_pos);
            }
        }
        KeyCode::Left => {
            app.cursor = app.cursor.saturating_sub(1);
        }
        KeyCode::Right => {
            let char_count = app.input.chars().count();
            app.cursor = (app.cursor + 1).min(char_count);
        }
        KeyCode::Home => {
            app.cursor = 0;
        }
        KeyCode::End => {
            app.cursor = app.input.chars().count();
        }
        KeyCode::Char(c) => {
            let byte_pos = char_to_byte_index(&app.input, app.cursor);
            app.input.insert(byte_pos, c);
            app.cursor += 1;
        }
        _ => {}
    }
}

fn handle_mouse(app: &mut App, mouse: MouseEvent) {
    match mouse.kind {
        MouseEventKind::ScrollDown => {
            app.scroll_down();
            app.scroll_down();
            app.scroll_down();
        }
        MouseEventKind::ScrollUp => {
            app.scroll_up();
            app.scroll_up();
            app.scroll_up();
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tokio::sync::mpsc;

    fn test_app() -> App {
        let mut config = Config::new();
        config.base_url = "http://127.0.0.1:1/v1/chat/completions".to_string();
        config.api_key = Some("test-key".to_string());
        App::with_config(&config).unwrap()
    }

    fn press(code: KeyCode) -> AppEvent {
        AppEvent::Key(KeyEvent::new(code, KeyModifiers::NONE))
    }

    #[test]
    fn typed_characters_land_at_the_cursor() {
        let mut app = test_app();
        let (tx, _rx) = mpsc::unbounded_channel();

        for c in "héllo".chars() {
            handle_event(&mut app, &tx, press(KeyCode::Char(c))).unwrap();
        }
        handle_event(&mut app, &tx, press(KeyCode::Left)).unwrap();
        handle_event(&mut app, &tx, press(KeyCode::Left)).unwrap();
        handle_event(&mut app, &tx, press(KeyCode::Char('x'))).unwrap();

        assert_eq!(app.input, "hélxlo");
        assert_eq!(app.cursor, 4);
    }

    #[test]
    fn backspace_removes_the_char_before_the_cursor() {
        let mut app = test_app();
        let (tx, _rx) = mpsc::unbounded_channel();

        app.input = "héllo".to_string();
        app.cursor = 2;
        handle_event(&mut app, &tx, press(KeyCode::Backspace)).unwrap();

        assert_eq!(app.input, "hllo");
        assert_eq!(app.cursor, 1);
    }

    #[test]
    fn escape_toggles_out_of_editing_and_dismisses_errors() {
        let mut app = test_app();
        let (tx, _rx) = mpsc::unbounded_channel();

        assert_eq!(app.input_mode, InputMode::Editing);
        handle_event(&mut app, &tx, press(KeyCode::Esc)).unwrap();
        assert_eq!(app.input_mode, InputMode::Normal);

        app.error = Some("endpoint returned 500".to_string());
        handle_event(&mut app, &tx, press(KeyCode::Esc)).unwrap();
        assert!(app.error.is_none());
    }

    #[test]
    fn q_quits_only_in_normal_mode() {
        let mut app = test_app();
        let (tx, _rx) = mpsc::unbounded_channel();

        handle_event(&mut app, &tx, press(KeyCode::Char('q'))).unwrap();
        assert!(!app.should_quit, "'q' in the input line is just a character");
        assert_eq!(app.input, "q");

        app.input_mode = InputMode::Normal;
        handle_event(&mut app, &tx, press(KeyCode::Char('q'))).unwrap();
        assert!(app.should_quit);
    }

    #[test]
    fn ctrl_c_quits_in_any_mode() {
        let mut app = test_app();
        let (tx, _rx) = mpsc::unbounded_channel();

        let event = AppEvent::Key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL));
        handle_event(&mut app, &tx, event).unwrap();
        assert!(app.should_quit);
    }
}
