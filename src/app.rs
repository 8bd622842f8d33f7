use anyhow::Result;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use futures_util::StreamExt;

use crate::completion::{CompletionClient, StreamEvent};
use crate::config::Config;
use crate::conversation::Conversation;
use crate::tui::AppEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Editing,
}

pub struct App {
    // Core state
    pub should_quit: bool,
    pub input_mode: InputMode,

    // Input line state
    pub input: String,
    pub cursor: usize, // cursor position in input, in chars

    // Chat state
    pub conversation: Conversation,
    pub error: Option<String>,
    /// Set between submission and the first fragment ("Thinking..." shown).
    pub waiting: bool,

    // Transcript viewport
    pub scroll: u16,
    /// Stick to the bottom while new content arrives, until the user
    /// scrolls up.
    pub auto_scroll: bool,
    pub chat_height: u16, // inner height of the transcript, set during render
    pub chat_width: u16,  // inner width, for wrap calculations

    // Animation state
    pub animation_frame: u8, // 0-2 for ellipsis animation

    /// Owned handle of the in-flight request. Holding it rejects further
    /// submissions; it is released on the terminal stream event.
    pub request: Option<JoinHandle<()>>,

    client: CompletionClient,
}

impl App {
    pub fn new() -> Result<Self> {
        let config = Config::load().unwrap_or_else(|_| Config::new());
        Self::with_config(&config)
    }

    pub fn with_config(config: &Config) -> Result<Self> {
        let client = CompletionClient::new(config)?;

        Ok(Self {
            should_quit: false,
            input_mode: InputMode::Editing,

            input: String::new(),
            cursor: 0,

            conversation: Conversation::new(),
            error: None,
            waiting: false,

            scroll: 0,
            auto_scroll: true,
            chat_height: 0,
            chat_width: 0,

            animation_frame: 0,

            request: None,

            client,
        })
    }

    pub fn model(&self) -> &str {
        self.client.model()
    }

    /// True while a completion request is in flight.
    pub fn is_busy(&self) -> bool {
        self.request.is_some()
    }

    /// Submit the current input line as a user message and open the
    /// completion stream.
    ///
    /// Whitespace-only input is rejected without touching the
    /// conversation. While a request handle is held, submissions are
    /// rejected; the handle is released again on the terminal event.
    pub fn submit(&mut self, events: &UnboundedSender<AppEvent>) {
        let text = self.input.trim();
        if text.is_empty() || self.is_busy() {
            return;
        }
        let text = text.to_string();

        self.input.clear();
        self.cursor = 0;
        self.error = None;
        self.conversation.push_user(text);
        self.waiting = true;
        self.scroll_to_bottom();

        // The spawned task owns the connection; the event loop folds the
        // forwarded events in arrival order.
        let client = self.client.clone();
        let context = self.conversation.messages().to_vec();
        let tx = events.clone();
        self.request = Some(tokio::spawn(async move {
            match client.stream_chat(&context).await {
                Ok(stream) => {
                    let mut stream = std::pin::pin!(stream);
                    while let Some(event) = stream.next().await {
                        if tx.send(AppEvent::Stream(event)).is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(AppEvent::Stream(StreamEvent::Failed(e.to_string())));
                }
            }
        }));
    }

    /// Fold one stream event into the chat state.
    pub fn apply_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Delta(fragment) => {
                self.waiting = false;
                self.conversation.apply_delta(&fragment);
                if self.auto_scroll {
                    self.scroll_to_bottom();
                }
            }
            StreamEvent::Done => {
                self.waiting = false;
                self.conversation.finalize();
                self.release_request();
            }
            StreamEvent::Failed(reason) => {
                // Committed history is kept; the in-flight message stays
                // truncated at whatever content had already been folded in.
                self.waiting = false;
                self.conversation.finalize();
                self.error = Some(reason);
                self.release_request();
                if self.auto_scroll {
                    self.scroll_to_bottom();
                }
            }
        }
    }

    fn release_request(&mut self) {
        // The task has already sent its terminal event; dropping the
        // handle just detaches the finished task.
        self.request = None;
    }

    /// Estimated rendered line count of the transcript, using the same
    /// wrap width as the view.
    pub fn transcript_line_count(&self) -> u16 {
        let wrap_width = if self.chat_width > 0 {
            self.chat_width as usize
        } else {
            50
        };

        let mut total_lines: u16 = 0;

        for msg in self.conversation.messages() {
            total_lines += 1; // Role line ("You:" or "AI:")
            for line in msg.content.lines() {
                // Use character count, not byte length, for proper UTF-8 handling
                let char_count = line.chars().count();
                if char_count == 0 {
                    total_lines += 1; // Empty line still takes one line
                } else {
                    total_lines += ((char_count / wrap_width) + 1) as u16;
                }
            }
            total_lines += 1; // Blank line after message
        }

        if self.waiting {
            total_lines += 2; // "AI:" + "Thinking..."
        }
        if self.error.is_some() {
            total_lines += 2; // blank line + error line
        }

        total_lines
    }

    pub fn scroll_to_bottom(&mut self) {
        let total_lines = self.transcript_line_count();
        let visible_height = if self.chat_height > 0 {
            self.chat_height
        } else {
            20
        };

        self.scroll = total_lines.saturating_sub(visible_height);
        self.auto_scroll = true;
    }

    pub fn scroll_up(&mut self) {
        self.scroll = self.scroll.saturating_sub(1);
        self.auto_scroll = false;
    }

    pub fn scroll_down(&mut self) {
        let max_scroll = self
            .transcript_line_count()
            .saturating_sub(self.chat_height.max(1));
        if self.scroll < max_scroll {
            self.scroll = self.scroll.saturating_add(1);
        }
        if self.scroll >= max_scroll {
            self.auto_scroll = true;
        }
    }

    pub fn scroll_half_page_up(&mut self) {
        self.scroll = self.scroll.saturating_sub(self.chat_height / 2);
        self.auto_scroll = false;
    }

    pub fn scroll_half_page_down(&mut self) {
        let max_scroll = self
            .transcript_line_count()
            .saturating_sub(self.chat_height.max(1));
        self.scroll = self
            .scroll
            .saturating_add(self.chat_height / 2)
            .min(max_scroll);
        if self.scroll >= max_scroll {
            self.auto_scroll = true;
        }
    }

    /// Tick animation frame (called by Tick event)
    pub fn tick_animation(&mut self) {
        if self.waiting {
            self.animation_frame = (self.animation_frame + 1) % 3;
        }
    }
}
