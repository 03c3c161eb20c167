use std::time::Duration;

use eframe::egui;
use tracing_subscriber::EnvFilter;

use termchat_core::Role;
use termchat_llm::{Backend, Manifest, RuntimeBackend};

mod context;

use context::{AppContext, MessageBody};

const TERMINAL_GREEN: egui::Color32 = egui::Color32::from_rgb(0x33, 0xff, 0x66);
const USER_CYAN: egui::Color32 = egui::Color32::from_rgb(0x66, 0xcc, 0xff);
const NOTICE_GRAY: egui::Color32 = egui::Color32::from_rgb(0x99, 0x99, 0x99);

struct ChatApp {
	ctx: AppContext<Backend>,
	input: String,
}

impl ChatApp {
	fn new(ctx: AppContext<Backend>) -> Self {
		Self {
			ctx,
			input: String::new(),
		}
	}

	fn role_color(role: Role) -> egui::Color32 {
		match role {
			Role::User => USER_CYAN,
			Role::Assistant => TERMINAL_GREEN,
			Role::System => NOTICE_GRAY,
		}
	}

	fn thinking_dots(time: f64) -> &'static str {
		match (time * 2.0) as u64 % 4 {
			0 => ".",
			1 => "..",
			2 => "...",
			_ => "..",
		}
	}
}

impl eframe::App for ChatApp {
	fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
		egui::TopBottomPanel::top("header").show(ctx, |ui| {
			ui.horizontal(|ui| {
				ui.heading(egui::RichText::new("TERMCHAT").color(TERMINAL_GREEN).monospace());
				ui.separator();
				if ui.button("LOAD MODEL").clicked() {
					self.ctx.load_model();
				}
				if ui.button("CLEAR CHAT").clicked() {
					self.ctx.clear();
				}
				if ui.add_enabled(self.ctx.is_generating(), egui::Button::new("STOP")).clicked() {
					self.ctx.stop();
				}
			});
		});

		egui::TopBottomPanel::bottom("footer").show(ctx, |ui| {
			ui.horizontal(|ui| {
				ui.monospace(format!("Backend: {}", self.ctx.adapter().backend().name()));
				ui.separator();
				ui.monospace(format!("Model: {}", self.ctx.status()));
				ui.separator();
				if !self.ctx.is_loaded() {
					ui.monospace(format!("Path: {}", self.ctx.model_path().display()));
					ui.separator();
				}
				ui.monospace(format!("Messages: {}", self.ctx.history().len()));
			});
		});

		egui::TopBottomPanel::bottom("input").show(ctx, |ui| {
			ui.add_space(4.0);
			ui.horizontal(|ui| {
				let resp = ui.add(
					egui::TextEdit::singleline(&mut self.input)
						.desired_width(ui.available_width() - 220.0)
						.hint_text("Type a message…"),
				);
				let enter = resp.lost_focus() && ui.input(|i| i.key_pressed(egui::Key::Enter));
				let send_clicked = ui.button("SEND").clicked();
				if (send_clicked || enter) && !self.input.trim().is_empty() {
					let text = std::mem::take(&mut self.input);
					self.ctx.send(&text);
					resp.request_focus();
				}
				ui.weak(if self.ctx.is_generating() { "Generating..." } else { "(Press Enter to send)" });
			});
			ui.add_space(4.0);
		});

		egui::CentralPanel::default().show(ctx, |ui| {
			let history = self.ctx.history();
			egui::ScrollArea::vertical().stick_to_bottom(true).show(ui, |ui| {
				if history.is_empty() {
					ui.colored_label(NOTICE_GRAY, "No messages yet. Type something to start chatting...");
				}
				for msg in history.messages() {
					ui.horizontal_wrapped(|ui| {
						ui.label(
							egui::RichText::new(format!("{}>", msg.role.label()))
								.color(Self::role_color(msg.role))
								.monospace()
								.strong(),
						);
						match self.ctx.message_body(msg) {
							MessageBody::Thinking => {
								let time = ui.input(|i| i.time);
								ui.colored_label(TERMINAL_GREEN, Self::thinking_dots(time));
							}
							MessageBody::Stopped => {
								ui.colored_label(NOTICE_GRAY, egui::RichText::new("(stopped)").monospace().italics());
							}
							MessageBody::Text(text) => {
								ui.label(egui::RichText::new(text).monospace());
							}
						}
					});
					ui.add_space(6.0);
				}
			});
		});

		if self.ctx.end_frame() {
			ctx.request_repaint_after(Duration::from_millis(16));
		}
	}
}

fn main() -> eframe::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let manifest_path = std::env::args().nth(1).unwrap_or_else(|| "termchat.toml".to_string());
	let manifest = match Manifest::load_or_default(&manifest_path) {
		Ok(m) => m,
		Err(e) => {
			tracing::error!(path = %manifest_path, error = %e, "invalid manifest, using defaults");
			Manifest::default()
		}
	};

	let backend = Backend::preferred();
	tracing::info!(backend = backend.name(), "starting termchat");
	let app_ctx = AppContext::new(backend, &manifest);

	let options = eframe::NativeOptions::default();
	eframe::run_native(
		"termchat",
		options,
		Box::new(move |cc| {
			cc.egui_ctx.set_visuals(egui::Visuals::dark());
			Ok(Box::new(ChatApp::new(app_ctx)))
		}),
	)
}
