use anyhow::{Context, Result};
use eframe::egui;
use flume::{Receiver, Sender};
use std::time::Duration;

use super::frame::ImageFrame;
use crate::api::{DisplayClient, DisplayEvent, Snapshot, NO_IMAGE_MESSAGE};

const MIN_REFRESH_SECS: u64 = 1;

pub struct SignageApp {
    event_rx: Receiver<DisplayEvent>,
    refresh_tx: Sender<()>,
    // Keeps the poller alive for as long as the window is open
    _runtime: tokio::runtime::Runtime,
    frame: Option<ImageFrame>,
    frame_key: Option<String>,
    subtitle: String,
    updated_at: Option<String>,
    image_error: Option<String>,
}

impl SignageApp {
    pub fn new(client: DisplayClient, refresh_secs: u64) -> Result<Self> {
        let runtime = tokio::runtime::Runtime::new().context("failed to start UI runtime")?;
        let (event_tx, event_rx) = flume::unbounded();
        let (refresh_tx, refresh_rx) = flume::unbounded();

        let every = Duration::from_secs(refresh_secs.max(MIN_REFRESH_SECS));
        runtime.spawn(client.poll_forever(event_tx, refresh_rx, every));

        Ok(Self {
            event_rx,
            refresh_tx,
            _runtime: runtime,
            frame: None,
            frame_key: None,
            subtitle: NO_IMAGE_MESSAGE.to_string(),
            updated_at: None,
            image_error: None,
        })
    }

    fn apply_snapshot(&mut self, ctx: &egui::Context, snapshot: Snapshot) {
        self.subtitle = snapshot.subtitle;
        self.updated_at = chrono::DateTime::from_timestamp(snapshot.record.timestamp, 0)
            .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string());

        if self.frame_key.as_deref() == Some(snapshot.image_key.as_str()) {
            return;
        }

        match snapshot.image {
            Some(bytes) => match ImageFrame::from_bytes(ctx, &snapshot.image_key, &bytes) {
                Ok(frame) => {
                    tracing::debug!("Showing {}", snapshot.image_key);
                    self.frame = Some(frame);
                    self.frame_key = Some(snapshot.image_key);
                    self.image_error = None;
                }
                Err(e) => {
                    tracing::warn!("{}", e);
                    self.image_error = Some(e);
                }
            },
            None => {
                self.image_error = Some(format!(
                    "Image unavailable: {}",
                    snapshot.record.result.url
                ));
            }
        }
    }

    fn clear(&mut self) {
        self.frame = None;
        self.frame_key = None;
        self.updated_at = None;
        self.image_error = None;
        self.subtitle = NO_IMAGE_MESSAGE.to_string();
    }
}

impl eframe::App for SignageApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        while let Ok(event) = self.event_rx.try_recv() {
            match event {
                DisplayEvent::Updated(snapshot) => self.apply_snapshot(ctx, snapshot),
                DisplayEvent::Empty => self.clear(),
            }
        }

        egui::TopBottomPanel::bottom("caption").show(ctx, |ui| {
            ui.add_space(4.0);
            ui.label(self.subtitle.as_str());
            if let Some(error) = &self.image_error {
                ui.colored_label(egui::Color32::LIGHT_RED, error.as_str());
            }
            ui.horizontal(|ui| {
                if ui.button("Refresh").clicked() && self.refresh_tx.send(()).is_err() {
                    tracing::warn!("Display poller is not running");
                }
                if let Some(updated) = &self.updated_at {
                    ui.weak(format!("Updated {}", updated));
                }
            });
            ui.add_space(4.0);
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.heading("Ambient-Aware Generative Signage");
            ui.label("Auto-refresh latest image.");
            ui.separator();

            let available = ui.available_size();
            ui.centered_and_justified(|ui| match &self.frame {
                Some(frame) => frame.show(ui, available),
                None => {
                    ui.label(NO_IMAGE_MESSAGE);
                }
            });
        });

        ctx.request_repaint_after(Duration::from_millis(250));
    }
}
