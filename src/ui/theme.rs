use owo_colors::Style;
use std::sync::OnceLock;

static THEME: OnceLock<Theme> = OnceLock::new();

/// Styles keyed by what a line reports, not by color
#[derive(Debug, Clone)]
pub struct Theme {
    /// Command banners
    pub title: Style,
    /// Applied migrations, a healthy pool, a valid schema
    pub good: Style,
    /// Failed migrations, an unreachable store, missing tables
    pub bad: Style,
    /// Degraded modes and advisory issues
    pub caution: Style,
    /// Migration version numbers
    pub version: Style,
    /// Field labels in summaries
    pub label: Style,
    /// Pending units and secondary detail
    pub faint: Style,
}

impl Theme {
    pub fn detect() -> Self {
        let interactive = console::Term::stdout().is_term() && console::colors_enabled();
        if interactive {
            Self::colored()
        } else {
            Self::plain()
        }
    }

    pub fn colored() -> Self {
        Self {
            title: Style::new().cyan().bold(),
            good: Style::new().green().bold(),
            bad: Style::new().red().bold(),
            caution: Style::new().yellow(),
            version: Style::new().blue().bold(),
            label: Style::new().dimmed(),
            faint: Style::new().bright_black(),
        }
    }

    pub fn plain() -> Self {
        Self {
            title: Style::new(),
            good: Style::new(),
            bad: Style::new(),
            caution: Style::new(),
            version: Style::new(),
            label: Style::new(),
            faint: Style::new(),
        }
    }

    /// `good` or `bad` depending on an outcome
    pub fn verdict(&self, ok: bool) -> Style {
        if ok { self.good.clone() } else { self.bad.clone() }
    }
}

pub fn theme() -> &'static Theme {
    THEME.get_or_init(Theme::detect)
}

#[cfg(test)]
mod tests {
    use super::*;
    use owo_colors::OwoColorize;

    #[test]
    fn test_plain_theme_leaves_text_untouched() {
        let plain = Theme::plain();
        assert_eq!(format!("{}", "001".style(plain.version.clone())), "001");
        assert_eq!(format!("{}", "ok".style(plain.verdict(true))), "ok");
    }

    #[test]
    fn test_verdict_follows_outcome() {
        let colored = Theme::colored();
        let good = format!("{}", "x".style(colored.verdict(true)));
        let bad = format!("{}", "x".style(colored.verdict(false)));
        assert_eq!(good, format!("{}", "x".style(colored.good.clone())));
        assert_eq!(bad, format!("{}", "x".style(colored.bad.clone())));
        assert_ne!(good, bad);
    }
}
