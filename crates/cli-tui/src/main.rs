use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use pipeline::{config::PipelineConfig, store::load_snapshots, Job, JobState};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::io::stdout;
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::System;
use humansize::{format_size, DECIMAL};

/// Default config location, same as the daemon's packaging
const DEFAULT_CONFIG_PATH: &str = "/etc/hlsd/config.toml";

struct App {
    jobs: Vec<Job>,
    system: System,
    table_state: TableState,
    should_quit: bool,
    job_state_dir: Option<PathBuf>,
    load_error: Option<String>,
}

impl App {
    fn new(job_state_dir: Option<PathBuf>) -> Self {
        Self {
            jobs: Vec::new(),
            system: System::new(),
            table_state: TableState::default(),
            should_quit: false,
            job_state_dir,
            load_error: None,
        }
    }

    fn refresh(&mut self) {
        self.system.refresh_all();

        let Some(dir) = &self.job_state_dir else {
            self.jobs.clear();
            self.load_error = Some("job_state_dir is not configured".to_string());
            return;
        };

        match load_snapshots(dir) {
            Ok(mut jobs) => {
                // Newest first
                jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                self.jobs = jobs;
                self.load_error = None;
            }
            Err(e) => {
                self.jobs.clear();
                self.load_error = Some(format!("{:#}", e));
            }
        }

        // Keep the selection inside the table
        match self.table_state.selected() {
            Some(_) if self.jobs.is_empty() => self.table_state.select(None),
            Some(i) if i >= self.jobs.len() => self.table_state.select(Some(self.jobs.len() - 1)),
            _ => {}
        }
    }

    fn count_by_state(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|j| j.state == state).count()
    }

    fn select_next(&mut self) {
        if self.jobs.is_empty() {
            return;
        }
        let next = match self.table_state.selected() {
            Some(i) => (i + 1).min(self.jobs.len() - 1),
            None => 0,
        };
        self.table_state.select(Some(next));
    }

    fn select_previous(&mut self) {
        if self.jobs.is_empty() {
            return;
        }
        let previous = self.table_state.selected().map(|i| i.saturating_sub(1)).unwrap_or(0);
        self.table_state.select(Some(previous));
    }

    fn selected_job(&self) -> Option<&Job> {
        self.table_state.selected().and_then(|i| self.jobs.get(i))
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // No --config: try the packaged location, then fall back to defaults
    let default_config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let config_path = if let Some(ref path) = args.config {
        Some(path.as_path())
    } else if default_config_path.exists() {
        Some(default_config_path.as_path())
    } else {
        None
    };

    let cfg = PipelineConfig::load_config(config_path)
        .context("Failed to load configuration")?;

    // Setup terminal
    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(cfg.job_state_dir.clone());
    let result = run(&mut terminal, &mut app);

    // Restore terminal even when the loop failed
    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;

    result
}

fn run(terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>, app: &mut App) -> Result<()> {
    use crossterm::event::{self, Event, KeyCode};

    loop {
        app.refresh();
        terminal.draw(|f| ui(f, app))?;

        if event::poll(Duration::from_millis(500))? {
            if let Event::Key(key) = event::read()? {
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => app.should_quit = true,
                    KeyCode::Char('r') => app.refresh(),
                    KeyCode::Down | KeyCode::Char('j') => app.select_next(),
                    KeyCode::Up | KeyCode::Char('k') => app.select_previous(),
                    _ => {}
                }
            }
        }

        if app.should_quit {
            return Ok(());
        }
    }
}

/// HLS pipeline job monitor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn ui(f: &mut Frame, app: &mut App) {
    let size = f.size();

    if size.height < 12 || size.width < 80 {
        let error_msg = Paragraph::new("Terminal too small! Please resize to at least 80x12.")
            .block(Block::default().borders(Borders::ALL).title("Error"))
            .style(Style::default().fg(Color::Red));
        f.render_widget(error_msg, size);
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // CPU / Memory / Done
            Constraint::Min(3),    // Job table
            Constraint::Length(3), // Selected job detail
            Constraint::Length(3), // Status bar
        ])
        .split(size);

    render_top_bar(f, app, chunks[0]);
    render_job_table(f, app, chunks[1]);
    render_detail(f, app, chunks[2]);
    render_status_bar(f, app, chunks[3]);
}

fn render_top_bar(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(33),
            Constraint::Percentage(34),
            Constraint::Percentage(33),
        ])
        .split(area);

    let cpu_usage = clamp_percent(app.system.global_cpu_usage() as f64);

    let total_memory = app.system.total_memory();
    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        clamp_percent(app.system.used_memory() as f64 / total_memory as f64 * 100.0)
    };

    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("CPU"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(cpu_usage as u16)
        .label(format!("{:.1}%", cpu_usage));
    f.render_widget(cpu_gauge, chunks[0]);

    let memory_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Memory"))
        .gauge_style(Style::default().fg(Color::Green))
        .percent(memory_percent as u16)
        .label(format!("{:.1}%", memory_percent));
    f.render_widget(memory_gauge, chunks[1]);

    // Share of known jobs that reached a terminal state
    let finished = app.jobs.iter().filter(|j| j.state.is_terminal()).count();
    let done_percent = if app.jobs.is_empty() {
        0.0
    } else {
        finished as f64 / app.jobs.len() as f64 * 100.0
    };
    let done_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Done"))
        .gauge_style(Style::default().fg(Color::Magenta))
        .percent(clamp_percent(done_percent) as u16)
        .label(format!("{}/{}", finished, app.jobs.len()));
    f.render_widget(done_gauge, chunks[2]);
}

fn render_job_table(f: &mut Frame, app: &mut App, area: Rect) {
    let header = Row::new(vec!["ST", "ID", "UPLOAD", "SIZE", "TIME", "RESULT"])
        .style(Style::default().add_modifier(Modifier::BOLD))
        .height(1);

    let rows: Vec<Row> = if app.jobs.is_empty() {
        let dir = app
            .job_state_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        vec![Row::new(vec![
            "-".to_string(),
            "No jobs".to_string(),
            format!("Dir: {}", dir),
            "-".to_string(),
            "-".to_string(),
            "-".to_string(),
        ])]
    } else {
        app.jobs
            .iter()
            .map(|job| {
                let style = Style::default().fg(state_color(job.state));
                Row::new(job_columns(job)).style(style).height(1)
            })
            .collect()
    };

    let widths = [
        Constraint::Length(5),
        Constraint::Percentage(20),
        Constraint::Percentage(25),
        Constraint::Length(9),
        Constraint::Length(7),
        Constraint::Percentage(40),
    ];

    let title = format!("Jobs ({})", app.jobs.len());
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .column_spacing(1);

    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn render_detail(f: &mut Frame, app: &App, area: Rect) {
    let text = match app.selected_job() {
        Some(job) => detail_line(job),
        None => "↑/↓ to select a job".to_string(),
    };

    let paragraph = Paragraph::new(text)
        .block(Block::default().borders(Borders::ALL).title("Selected"))
        .wrap(ratatui::widgets::Wrap { trim: true });
    f.render_widget(paragraph, area);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let text = match &app.load_error {
        Some(e) => format!("Cannot read jobs: {} | q=quit r=refresh", truncate_string(e, 60)),
        None => format!(
            "Total: {} | Pending: {} | Encoding: {} | Thumbnailing: {} | Ready: {} | Failed: {} | q=quit r=refresh",
            app.jobs.len(),
            app.count_by_state(JobState::Pending),
            app.count_by_state(JobState::Encoding),
            app.count_by_state(JobState::Thumbnailing),
            app.count_by_state(JobState::Ready),
            app.count_by_state(JobState::Failed),
        ),
    };

    let style = if app.load_error.is_some() {
        Style::default().fg(Color::Red)
    } else {
        Style::default()
    };

    let paragraph = Paragraph::new(text)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .style(style)
        .wrap(ratatui::widgets::Wrap { trim: true });
    f.render_widget(paragraph, area);
}

/// Table cells for one job
fn job_columns(job: &Job) -> Vec<String> {
    let size = job
        .source_bytes
        .map(|b| format_size(b, DECIMAL))
        .unwrap_or_else(|| "-".to_string());

    // Running jobs count up to now, finished ones to their last update
    let end = if job.state.is_terminal() { job.updated_at } else { Utc::now() };
    let elapsed = (end - job.created_at).num_seconds().max(0);

    let result = match (&job.playlist_url, &job.failure) {
        (_, Some(reason)) => reason.kind.to_string(),
        (Some(url), None) if job.thumbnail_url.is_none() => format!("{} (no thumb)", url),
        (Some(url), None) => url.clone(),
        (None, None) => "-".to_string(),
    };

    vec![
        state_label(job.state).to_string(),
        truncate_string(&job.id, 32),
        truncate_string(&job.original_filename, 40),
        size,
        format_elapsed(elapsed),
        truncate_string(&result, 60),
    ]
}

fn detail_line(job: &Job) -> String {
    if let Some(reason) = &job.failure {
        return format!("{}: {}", job.id, reason);
    }
    let mut line = format!("{}: {:?}", job.id, job.state);
    if let Some(url) = &job.playlist_url {
        line.push_str(&format!(" | {}", url));
    }
    if let Some(url) = &job.thumbnail_url {
        line.push_str(&format!(" | {}", url));
    }
    if let Some(err) = &job.thumbnail_error {
        line.push_str(&format!(" | thumbnail: {}", err));
    }
    line
}

fn state_label(state: JobState) -> &'static str {
    match state {
        JobState::Pending => "PEND",
        JobState::Encoding => "ENC",
        JobState::Thumbnailing => "THMB",
        JobState::Ready => "OK",
        JobState::Failed => "FAIL",
    }
}

fn state_color(state: JobState) -> Color {
    match state {
        JobState::Pending => Color::Gray,
        JobState::Encoding | JobState::Thumbnailing => Color::Yellow,
        JobState::Ready => Color::Green,
        JobState::Failed => Color::Red,
    }
}

fn format_elapsed(secs: i64) -> String {
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
