//! Spoken phrases built from system recordings
//!
//! A phrase is a comma separated list of `data|code` parts:
//!
//! | code | meaning    | example        | files played                          |
//! |------|------------|----------------|---------------------------------------|
//! | `C`  | characters | `12a#\|C`      | `1 2 a pound`                         |
//! | `F`  | file       | `hello.wav\|F` | `hello.wav`                           |
//! | `N`  | number     | `-12.5\|N`     | `negative 12 point 5`                 |
//! | `M`  | money      | `5.23\|M`      | `5 dollars and 20 3 cents`            |
//! | `O`  | ordinal    | `3\|O`         | `ord3`                                |
//!
//! System recordings are looked up as `<root>/<name>.wav`; `F` parts are played as given.

use std::path::Path;
use std::time::Duration;

use crate::error::{LineError, LineResult};

/// Silence played for a space in a characters part
pub const CHARACTER_PAUSE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhraseCode {
    Characters,
    File,
    Number,
    Money,
    Ordinal,
}

impl PhraseCode {
    fn parse(code: &str) -> LineResult<Self> {
        match code.trim() {
            "C" | "c" => Ok(Self::Characters),
            "F" | "f" => Ok(Self::File),
            "N" | "n" => Ok(Self::Number),
            "M" | "m" => Ok(Self::Money),
            "O" | "o" => Ok(Self::Ordinal),
            "D" | "d" => Err(LineError::invalid_argument("date phrases are not supported")),
            other => Err(LineError::invalid_argument(format!("unknown phrase code '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhrasePart {
    pub data: String,
    pub code: PhraseCode,
}

/// One step of a rendered phrase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhraseItem {
    File(String),
    Pause(Duration),
}

/// Whether `text` is a phrase rather than a plain file name
pub fn is_phrase(text: &str) -> bool {
    text.contains('|')
}

pub fn parse_phrase(phrase: &str) -> LineResult<Vec<PhrasePart>> {
    phrase
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            let (data, code) = part
                .split_once('|')
                .ok_or_else(|| LineError::invalid_argument(format!("phrase part '{part}' has no code")))?;
            Ok(PhrasePart {
                data: data.trim().to_string(),
                code: PhraseCode::parse(code)?,
            })
        })
        .collect()
}

/// Turn a phrase into the files and pauses to play, in order
pub fn render_phrase(phrase: &str, root: &Path) -> LineResult<Vec<PhraseItem>> {
    let mut renderer = Renderer {
        root,
        items: Vec::new(),
    };
    for part in parse_phrase(phrase)? {
        renderer.part(&part)?;
    }
    Ok(renderer.items)
}

struct Renderer<'a> {
    root: &'a Path,
    items: Vec<PhraseItem>,
}

impl Renderer<'_> {
    fn system(&mut self, name: impl AsRef<str>) {
        let path = self.root.join(format!("{}.wav", name.as_ref()));
        self.items
            .push(PhraseItem::File(path.to_string_lossy().into_owned()));
    }

    fn part(&mut self, part: &PhrasePart) -> LineResult<()> {
        match part.code {
            PhraseCode::Characters => self.characters(&part.data),
            PhraseCode::File => {
                self.items.push(PhraseItem::File(part.data.clone()));
                Ok(())
            }
            PhraseCode::Number => self.number(&part.data),
            PhraseCode::Money => self.money(&part.data),
            PhraseCode::Ordinal => self.ordinal(&part.data),
        }
    }

    fn characters(&mut self, data: &str) -> LineResult<()> {
        for c in data.chars() {
            match c {
                ' ' => self.items.push(PhraseItem::Pause(CHARACTER_PAUSE)),
                '*' => self.system("star"),
                '#' => self.system("pound"),
                c if c.is_ascii_alphanumeric() => self.system(c.to_ascii_lowercase().to_string()),
                _ => {}
            }
        }
        Ok(())
    }

    fn number(&mut self, data: &str) -> LineResult<()> {
        let value = parse_decimal(data)?;
        let text = value.to_string();
        let (whole, fraction) = text.split_once('.').unwrap_or((text.as_str(), ""));
        self.integer(parse_integer(whole)?);
        if !fraction.is_empty() {
            self.system("point");
            for digit in fraction.chars() {
                self.system(digit.to_string());
            }
        }
        Ok(())
    }

    fn money(&mut self, data: &str) -> LineResult<()> {
        let value = parse_decimal(data)?;
        let text = format!("{value:.2}");
        let (whole, cents) = text.split_once('.').unwrap_or((text.as_str(), "00"));
        let dollars = parse_integer(whole)?;
        let cents = parse_integer(cents)?;

        self.integer(dollars);
        self.system(if dollars.abs() == 1 { "dollar" } else { "dollars" });
        self.system("and");
        self.integer(cents);
        self.system(if cents == 1 { "cent" } else { "cents" });
        Ok(())
    }

    fn ordinal(&mut self, data: &str) -> LineResult<()> {
        let n = parse_integer(data)?;
        if n < 1 {
            return Err(LineError::invalid_argument(format!("ordinal '{data}' must be positive")));
        }
        self.system(format!("ord{n}"));
        Ok(())
    }

    fn integer(&mut self, n: i64) {
        if n < 0 {
            self.system("negative");
        }
        if n == 0 {
            self.system("0");
            return;
        }
        self.positive(n.unsigned_abs());
    }

    fn positive(&mut self, mut n: u64) {
        for (scale, name) in [
            (1_000_000_000, "Billion"),
            (1_000_000, "Million"),
            (1_000, "Thousand"),
        ] {
            if n >= scale {
                let group = n / scale;
                if group > 999 {
                    self.positive(group);
                } else {
                    self.up_to_999(group);
                }
                self.system(name);
                n %= scale;
            }
        }
        self.up_to_999(n);
    }

    fn up_to_999(&mut self, n: u64) {
        let hundreds = n / 100;
        let rest = n % 100;
        if hundreds > 0 {
            self.system(format!("{hundreds}00"));
        }
        if rest == 0 {
            return;
        }
        if rest < 20 {
            self.system(rest.to_string());
        } else {
            self.system(format!("{}0", rest / 10));
            if rest % 10 != 0 {
                self.system((rest % 10).to_string());
            }
        }
    }
}

fn parse_decimal(data: &str) -> LineResult<f64> {
    data.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| LineError::invalid_argument(format!("'{data}' is not a number")))
}

fn parse_integer(data: &str) -> LineResult<i64> {
    data.trim()
        .parse::<i64>()
        .map_err(|_| LineError::invalid_argument(format!("'{data}' is not an integer")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(phrase: &str) -> Vec<String> {
        render_phrase(phrase, Path::new("sys"))
            .unwrap()
            .into_iter()
            .map(|item| match item {
                PhraseItem::File(path) => Path::new(&path)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or(path),
                PhraseItem::Pause(_) => "_".to_string(),
            })
            .collect()
    }

    #[test]
    fn test_parse_parts() {
        let parts = parse_phrase("hello.wav|F, 42|N").unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].code, PhraseCode::File);
        assert_eq!(parts[1].data, "42");
        assert!(parse_phrase("42").is_err());
        assert!(parse_phrase("2020-01-01|D").is_err());
        assert!(parse_phrase("1|Z").is_err());
    }

    #[test]
    fn test_characters() {
        assert_eq!(names("1A *#|C"), vec!["1", "a", "_", "star", "pound"]);
    }

    #[test]
    fn test_integers() {
        assert_eq!(names("0|N"), vec!["0"]);
        assert_eq!(names("7|N"), vec!["7"]);
        assert_eq!(names("15|N"), vec!["15"]);
        assert_eq!(names("40|N"), vec!["40"]);
        assert_eq!(names("1234|N"), vec!["1", "Thousand", "200", "30", "4"]);
        assert_eq!(
            names("2000015|N"),
            vec!["2", "Million", "15"]
        );
        assert_eq!(names("-305|N"), vec!["negative", "300", "5"]);
    }

    #[test]
    fn test_decimal_number() {
        assert_eq!(names("12.05|N"), vec!["12", "point", "0", "5"]);
    }

    #[test]
    fn test_money() {
        assert_eq!(
            names("5.23|M"),
            vec!["5", "dollars", "and", "20", "3", "cents"]
        );
        assert_eq!(names("1.01|M"), vec!["1", "dollar", "and", "1", "cent"]);
        assert_eq!(names("3|M"), vec!["3", "dollars", "and", "0", "cents"]);
    }

    #[test]
    fn test_ordinal_and_file() {
        assert_eq!(names("3|O"), vec!["ord3"]);
        assert!(render_phrase("0|O", Path::new("sys")).is_err());

        let items = render_phrase("greeting.wav|F", Path::new("sys")).unwrap();
        assert_eq!(items, vec![PhraseItem::File("greeting.wav".to_string())]);
    }

    #[test]
    fn test_system_files_live_under_root() {
        let items = render_phrase("9|C", Path::new("System Recordings")).unwrap();
        let expected = Path::new("System Recordings").join("9.wav");
        assert_eq!(items, vec![PhraseItem::File(expected.to_string_lossy().into_owned())]);
    }

    #[test]
    fn test_is_phrase() {
        assert!(is_phrase("1|N"));
        assert!(!is_phrase("prompt.wav"));
    }
}
