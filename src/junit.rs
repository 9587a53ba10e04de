//! JUnit XML report emission (Section 6): one `<testsuite>` per
//! [`SuiteReport`](crate::runner::SuiteReport), written with `quick-xml`.

use std::io::Cursor;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::runner::{Outcome, SuiteReport};

/// Serializes every suite into a single `<testsuites>` document.
pub fn render(suites: &[SuiteReport]) -> Result<String, quick_xml::Error> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer.write_event(Event::Start(BytesStart::new("testsuites")))?;
    for suite in suites {
        write_suite(&mut writer, suite)?;
    }
    writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

    let bytes = writer.into_inner().into_inner();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn write_suite(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    suite: &SuiteReport,
) -> Result<(), quick_xml::Error> {
    let mut start = BytesStart::new("testsuite");
    start.push_attribute(("name", suite.name.as_str()));
    start.push_attribute(("tests", suite.tests().to_string().as_str()));
    start.push_attribute(("failures", suite.failures().to_string().as_str()));
    start.push_attribute(("skipped", suite.skipped().to_string().as_str()));
    start.push_attribute(("time", format!("{:.3}", suite.total_time().as_secs_f64()).as_str()));
    writer.write_event(Event::Start(start))?;

    for result in &suite.results {
        let mut tc = BytesStart::new("testcase");
        tc.push_attribute(("classname", result.classname.as_str()));
        tc.push_attribute(("name", result.name.as_str()));
        tc.push_attribute(("time", format!("{:.3}", result.time.as_secs_f64()).as_str()));

        match &result.outcome {
            Outcome::Passed => {
                writer.write_event(Event::Empty(tc))?;
            }
            Outcome::Failed { message } => {
                writer.write_event(Event::Start(tc))?;
                let mut failure = BytesStart::new("failure");
                failure.push_attribute(("message", message.as_str()));
                failure.push_attribute(("type", "AssertionError"));
                writer.write_event(Event::Empty(failure))?;
                writer.write_event(Event::End(BytesEnd::new("testcase")))?;
            }
            Outcome::Skipped { reason } => {
                writer.write_event(Event::Start(tc))?;
                let mut skipped = BytesStart::new("skipped");
                skipped.push_attribute(("message", reason.as_str()));
                writer.write_event(Event::Empty(skipped))?;
                writer.write_event(Event::End(BytesEnd::new("testcase")))?;
            }
        }
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    Ok(())
}

/// Dummy element helper kept for call sites that want an escaped text node;
/// unused by `render` itself but mirrors the teacher's quick-xml usage.
#[allow(dead_code)]
fn text_event(s: &str) -> Event<'_> {
    Event::Text(BytesText::new(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::TestResult;
    use std::time::Duration;

    #[test]
    fn renders_passed_failed_and_skipped_testcases() {
        let suite = SuiteReport {
            name: "No restrictions".into(),
            results: vec![
                TestResult {
                    classname: "No restrictions".into(),
                    name: "ping reaches peer vpc".into(),
                    time: Duration::from_secs(2),
                    outcome: Outcome::Passed,
                },
                TestResult {
                    classname: "No restrictions".into(),
                    name: "throughput below floor".into(),
                    time: Duration::from_millis(500),
                    outcome: Outcome::Failed {
                        message: "below min-speed 10 Mbps".into(),
                    },
                },
                TestResult {
                    classname: "No restrictions".into(),
                    name: "extended only".into(),
                    time: Duration::ZERO,
                    outcome: Outcome::Skipped {
                        reason: "Skip-flag dominance".into(),
                    },
                },
            ],
        };
        let xml = render(&[suite]).unwrap();
        assert!(xml.contains("<testsuites>"));
        assert!(xml.contains(r#"tests="3""#));
        assert!(xml.contains(r#"failures="1""#));
        assert!(xml.contains(r#"skipped="1""#));
        assert!(xml.contains("<failure message=\"below min-speed 10 Mbps\" type=\"AssertionError\"/>"));
        assert!(xml.contains("<skipped message=\"Skip-flag dominance\"/>"));
    }

    #[test]
    fn empty_suite_list_still_wraps_in_testsuites() {
        let xml = render(&[]).unwrap();
        assert!(xml.starts_with("<testsuites>"));
        assert!(xml.trim_end().ends_with("</testsuites>"));
    }
}
