use std::{collections::BTreeMap, fs, path::Path};
use thiserror::Error;

pub const SLURM_RUNNER: &str = include_str!("../../templates/slurm_runner.sh");
pub const SPLIT_JOB: &str = include_str!("../../templates/split_job.sh");

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("No value for placeholder ${{{0}}}")]
    MissingValue(String),
    #[error("Unterminated placeholder at byte {0}")]
    Unterminated(usize),
    #[error("Failed to read job script template")]
    Io(#[from] std::io::Error),
}

/// Job script with `${name}` placeholders, bare `$VAR` is left for the shell
#[derive(Clone, Debug)]
pub struct JobTemplate {
    text: String,
}

impl JobTemplate {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// use `path` when given, the built-in template otherwise
    pub fn load_or(path: Option<&Path>, builtin: &str) -> Result<Self, TemplateError> {
        match path {
            Some(path) => Ok(Self::new(fs::read_to_string(path)?)),
            None => Ok(Self::new(builtin)),
        }
    }

    pub fn render(&self, values: &BTreeMap<&str, String>) -> Result<String, TemplateError> {
        let mut rendered = String::with_capacity(self.text.len());
        let mut rest = self.text.as_str();
        let mut offset = 0;

        while let Some(start) = rest.find("${") {
            rendered.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or(TemplateError::Unterminated(offset + start))?;
            let key = &after[..end];

            let value = values
                .get(key)
                .ok_or_else(|| TemplateError::MissingValue(key.to_string()))?;
            rendered.push_str(value);

            let consumed = start + 2 + end + 1;
            offset += consumed;
            rest = &rest[consumed..];
        }

        rendered.push_str(rest);
        Ok(rendered)
    }
}

/// Quote a word for a POSIX shell
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c))
    {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_substituted() {
        let template = JobTemplate::new("#SBATCH -p ${partition}\necho $SLURM_JOB_NODELIST ${p}\n");
        let values = BTreeMap::from([("partition", "spot".to_string()), ("p", "100".to_string())]);

        assert_eq!(
            template.render(&values).unwrap(),
            "#SBATCH -p spot\necho $SLURM_JOB_NODELIST 100\n"
        );
    }

    #[test]
    fn missing_values_are_errors() {
        let template = JobTemplate::new("${job_name} ${unknown}");
        let values = BTreeMap::from([("job_name", "a".to_string())]);

        assert!(matches!(
            template.render(&values),
            Err(TemplateError::MissingValue(key)) if key == "unknown"
        ));
        assert!(matches!(
            JobTemplate::new("abc ${open").render(&values),
            Err(TemplateError::Unterminated(4))
        ));
    }

    #[test]
    fn builtin_runner_declares_all_placeholders() {
        let keys = [
            "job_name",
            "partition",
            "log_file_path",
            "batch_dir",
            "dvmdostem_binary",
            "config_path",
            "log_level",
            "p",
            "e",
            "s",
            "t",
            "n",
        ];
        let values: BTreeMap<&str, String> =
            keys.iter().map(|key| (*key, format!("<{key}>"))).collect();
        let rendered = JobTemplate::new(SLURM_RUNNER).render(&values).unwrap();

        assert!(rendered.contains("#SBATCH -p <partition>"));
        assert!(rendered.contains("-f <config_path> -l <log_level>"));
        assert!(rendered.contains("$SLURM_JOB_NODELIST"));
    }

    #[test]
    fn words_are_quoted_for_the_shell() {
        assert_eq!(shell_quote("/opt/bp"), "/opt/bp");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
