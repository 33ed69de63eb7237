//! Output hooks of the CLI

use cadence_core::Job;
use cadence_core::hooks::{OutputHook, OutputStream};

/// Echoes job output to the terminal, one prefixed line at a time
///
/// Output is passed through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoOutputHook;

impl OutputHook for EchoOutputHook {
    fn on_new_output(&self, job: &Job, output: String, stream: OutputStream) -> String {
        let prefix = match job.id {
            Some(id) => format!("Job {}: ", id),
            None => "Job: ".to_string(),
        };
        let echoed = prefix_lines(&prefix, &output);

        match stream {
            OutputStream::Stdout => print!("{}", echoed),
            OutputStream::Stderr => eprint!("{}", echoed),
        }

        output
    }
}

fn prefix_lines(prefix: &str, output: &str) -> String {
    let mut echoed = String::with_capacity(output.len());
    for line in output.lines() {
        echoed.push_str(prefix);
        echoed.push_str(line);
        echoed.push('\n');
    }
    echoed
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{JobId, JobState};

    #[test]
    fn test_prefix_lines() {
        assert_eq!(prefix_lines("Job 4: ", "a\nb\n"), "Job 4: a\nJob 4: b\n");
        assert_eq!(prefix_lines("Job 4: ", "tail"), "Job 4: tail\n");
        assert_eq!(prefix_lines("Job 4: ", ""), "");
    }

    #[test]
    fn test_output_is_unchanged() {
        let job = Job::new("cmd", vec![]).restored(JobId(4), JobState::Running);
        let output = EchoOutputHook.on_new_output(&job, "x\n".to_string(), OutputStream::Stdout);
        assert_eq!(output, "x\n");
    }
}
