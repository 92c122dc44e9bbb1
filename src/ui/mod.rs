mod theme;

use crate::app::{AppModel, LogLevel};
use crate::domain::SessionState;
use ratatui::prelude::*;
use ratatui::widgets::*;

pub fn render(frame: &mut Frame, model: &AppModel) {
    let full_area = frame.area();
    if full_area.width == 0 || full_area.height == 0 {
        return;
    }

    let summary_height = model
        .eval_summary
        .as_ref()
        .filter(|summary| !summary.is_empty())
        .map(|summary| (summary.fields.len() as u16).min(8) + 2)
        .unwrap_or(0);

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Length(3),
            Constraint::Length(1),
            Constraint::Length(1),
            Constraint::Length(summary_height),
            Constraint::Min(3),
        ])
        .split(full_area);

    render_menu_bar(frame, chunks[0], model);
    render_gauge(frame, chunks[1], model);
    render_stats(frame, chunks[2], model);
    render_status(frame, chunks[3], model);
    if summary_height > 0 {
        render_eval_summary(frame, chunks[4], model);
    }
    render_log(frame, chunks[5], model);

    if model.help_open {
        render_help_overlay(frame, full_area);
    }
}

fn render_menu_bar(frame: &mut Frame, area: Rect, model: &AppModel) {
    let base_style = Style::default().fg(theme::FG).bg(theme::BAR_BG);
    let title_style = Style::default()
        .fg(theme::ACCENT)
        .bg(theme::BAR_BG)
        .add_modifier(Modifier::BOLD);
    let hint_style = Style::default().fg(theme::MUTED).bg(theme::BAR_BG);

    let mut spans = vec![Span::styled(" trainbox ", title_style)];
    if let Some(tag) = &model.tag {
        spans.push(Span::styled(format!(" [{tag}]"), base_style));
    }
    if let Some((run, of)) = model.run.filter(|(_, of)| *of > 1) {
        spans.push(Span::styled(format!("  run {run}/{of}"), base_style));
    }
    let hints = if model.is_settled() {
        "   q quit · ? help"
    } else {
        "   c cancel · q quit · ? help"
    };
    spans.push(Span::styled(hints, hint_style));

    frame.render_widget(Paragraph::new(Line::from(spans)).style(base_style), area);
}

fn render_gauge(frame: &mut Frame, area: Rect, model: &AppModel) {
    let (ratio, label) = match &model.progress {
        Some(snapshot) => (snapshot.ratio().unwrap_or(0.0), snapshot.label()),
        None => (0.0, "waiting for progress".to_string()),
    };
    let gauge = Gauge::default()
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(theme::BORDER))
                .title("Progress"),
        )
        .gauge_style(Style::default().fg(theme::ACCENT).bg(theme::SURFACE))
        .ratio(ratio)
        .label(label);
    frame.render_widget(gauge, area);
}

fn render_stats(frame: &mut Frame, area: Rect, model: &AppModel) {
    let text = model
        .progress
        .as_ref()
        .map(|snapshot| snapshot.stats_line())
        .unwrap_or_else(|| "— it/s • elapsed 00:00".to_string());
    frame.render_widget(
        Paragraph::new(format!(" {text}")).style(Style::default().fg(theme::MUTED)),
        area,
    );
}

fn render_status(frame: &mut Frame, area: Rect, model: &AppModel) {
    let color = match model.state {
        SessionState::Completed => theme::SUCCESS,
        SessionState::Failed => theme::ERROR,
        SessionState::Cancelled => theme::WARNING,
        SessionState::Starting | SessionState::Running | SessionState::Finishing => theme::ACCENT,
        SessionState::Idle => theme::MUTED,
    };
    let line = Line::from(vec![
        Span::styled(" ● ", Style::default().fg(color)),
        Span::styled(model.status.clone(), Style::default().fg(theme::FG)),
    ]);
    frame.render_widget(Paragraph::new(line), area);
}

fn render_eval_summary(frame: &mut Frame, area: Rect, model: &AppModel) {
    let Some(summary) = &model.eval_summary else {
        return;
    };
    let lines = summary
        .fields
        .iter()
        .map(|(key, value)| {
            Line::from(vec![
                Span::styled(format!("{key}: "), Style::default().fg(theme::MUTED)),
                Span::styled(value.clone(), Style::default().fg(theme::FG)),
            ])
        })
        .collect::<Vec<_>>();
    let paragraph = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(theme::BORDER))
            .title("Evaluation summary"),
    );
    frame.render_widget(paragraph, area);
}

fn render_log(frame: &mut Frame, area: Rect, model: &AppModel) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(theme::BORDER))
        .title(if model.log_scroll > 0 {
            format!("Log (scrolled {} up, End to follow)", model.log_scroll)
        } else {
            "Log".to_string()
        });
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let height = inner.height as usize;
    let end = model.log.len().saturating_sub(model.log_scroll);
    let start = end.saturating_sub(height);
    let lines = model
        .log
        .range(start..end)
        .map(|entry| {
            let color = match entry.level {
                LogLevel::Output => theme::FG,
                LogLevel::Stderr => theme::ERROR,
                LogLevel::Info => theme::MUTED,
                LogLevel::Warning => theme::WARNING,
                LogLevel::Error => theme::ERROR,
            };
            Line::styled(entry.text.clone(), Style::default().fg(color))
        })
        .collect::<Vec<_>>();
    frame.render_widget(Paragraph::new(lines), inner);
}

fn render_help_overlay(frame: &mut Frame, area: Rect) {
    let popup = centered_rect(60, 50, area);
    frame.render_widget(Clear, popup);

    let text = vec![
        Line::from("Session"),
        Line::from("  - c: cancel the running session (and any remaining runs)"),
        Line::from("  - q / Esc: cancel and quit"),
        Line::from("  - Ctrl+C: quit"),
        Line::from(""),
        Line::from("Log"),
        Line::from("  - ↑/↓ or k/j: scroll one line"),
        Line::from("  - PgUp/PgDn: scroll ten lines"),
        Line::from("  - End: follow new output"),
        Line::from(""),
        Line::from("Help"),
        Line::from("  - ?: toggle this help"),
    ];

    let paragraph = Paragraph::new(text)
        .style(Style::default().fg(theme::FG))
        .wrap(Wrap { trim: false })
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(theme::DIM))
                .padding(Padding::horizontal(1))
                .title("Help (? to close)"),
        );
    frame.render_widget(paragraph, popup);
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProgressSnapshot;
    use ratatui::backend::TestBackend;
    use std::time::Duration;

    fn rendered_text(model: &AppModel) -> String {
        let backend = TestBackend::new(80, 24);
        let mut terminal = Terminal::new(backend).expect("terminal");
        terminal
            .draw(|frame| render(frame, model))
            .expect("draw");
        let buffer = terminal.backend().buffer();
        let mut text = String::new();
        for y in 0..buffer.area.height {
            for x in 0..buffer.area.width {
                text.push_str(buffer[(x, y)].symbol());
            }
            text.push('\n');
        }
        text
    }

    #[test]
    fn shows_progress_label_stats_and_log() {
        let mut model = AppModel::new("TRAIN running");
        model.state = SessionState::Running;
        model.tag = Some("TRAIN".to_string());
        model.progress = Some(ProgressSnapshot {
            current: 3,
            total: 10,
            rate: 1.5,
            elapsed: Duration::from_secs(2),
            eta: Some(Duration::from_secs(5)),
        });
        model.push_log(LogLevel::Output, "reward=1.25");

        let text = rendered_text(&model);
        assert!(text.contains("ep=3/10 (30%)"));
        assert!(text.contains("1.5 it/s"));
        assert!(text.contains("TRAIN running"));
        assert!(text.contains("reward=1.25"));
    }

    #[test]
    fn renders_without_progress() {
        let text = rendered_text(&AppModel::new("idle"));
        assert!(text.contains("waiting for progress"));
    }
}
