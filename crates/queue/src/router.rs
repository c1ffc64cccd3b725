/// Keyword router: canonical question text → routing command.
///
/// The production router is a model; this heuristic stands in at the enqueue
/// boundary and falls through to the receptionist for anything it cannot
/// place. Matching runs on the canonical (lowercased, de-punctuated) form.
pub fn route_question(canonical: &str) -> &'static str {
    let has_any = |needles: &[&str]| needles.iter().any(|needle| canonical.contains(needle));

    if has_any(&["podcast", "episode"]) {
        return "agent router go to podcast";
    }
    if has_any(&["research", "deep dive", "write a report"]) {
        return "agent router go to research";
    }
    if has_any(&["weather", "temperature", "forecast", "rain", "snow"]) {
        return "agent router go to weather";
    }
    if has_any(&["calendar", "meeting", "appointment", "schedule", "event"]) {
        return "agent router go to calendar";
    }
    if has_any(&["todo", "to do", "task list", "my tasks"]) {
        return "agent router go to todo list";
    }
    if has_any(&["time", "date", "today", "tomorrow", "yesterday", "what day"]) {
        return "agent router go to date and time";
    }
    if has_any(&["plus", "minus", "times", "divided", "sum", "multiply", "calculate", "squared"])
        || (canonical.chars().any(|c| c.is_ascii_digit()) && has_any(&["what is", "how much"]))
    {
        return "agent router go to math";
    }
    "agent router go to receptionist"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn math_questions_route_to_math() {
        assert_eq!(route_question("what is 2 plus 2"), "agent router go to math");
        assert_eq!(route_question("what is 17 2"), "agent router go to math");
        assert_eq!(route_question("calculate the square root of 9"), "agent router go to math");
    }

    #[test]
    fn date_time_and_weather_routes() {
        assert_eq!(route_question("what time is it"), "agent router go to date and time");
        assert_eq!(route_question("what day is tomorrow"), "agent router go to date and time");
        assert_eq!(route_question("whats the weather in tokyo"), "agent router go to weather");
    }

    #[test]
    fn calendar_and_todo_routes() {
        assert_eq!(route_question("whats on my calendar"), "agent router go to calendar");
        assert_eq!(route_question("add milk to my todo list"), "agent router go to todo list");
    }

    #[test]
    fn long_running_families() {
        assert_eq!(
            route_question("research the history of rust"),
            "agent router go to research"
        );
        assert_eq!(route_question("make me a podcast about it"), "agent router go to podcast");
    }

    #[test]
    fn everything_else_reaches_the_receptionist() {
        assert_eq!(route_question("hello are you there"), "agent router go to receptionist");
        assert_eq!(route_question(""), "agent router go to receptionist");
    }
}
