use anyhow::Result;
use tokio::sync::mpsc::UnboundedSender;

use charla::app::App;
use charla::handler;
use charla::tui::{self, AppEvent, EventHandler, Tui};
use charla::ui;

#[tokio::main]
async fn main() -> Result<()> {
    // Fails before the terminal is touched when no API key is configured,
    // so the message stays readable.
    let mut app = App::new()?;

    tui::install_panic_hook();
    let mut terminal = tui::init()?;
    let mut events = EventHandler::new();
    let sender = events.sender();

    let result = run(&mut terminal, &mut events, &sender, &mut app).await;

    tui::restore()?;
    result
}

async fn run(
    terminal: &mut Tui,
    events: &mut EventHandler,
    sender: &UnboundedSender<AppEvent>,
    app: &mut App,
) -> Result<()> {
    while !app.should_quit {
        terminal.draw(|frame| ui::render(app, frame))?;

        match events.next().await {
            Some(event) => handler::handle_event(app, sender, event)?,
            None => break,
        }
    }
    Ok(())
}
