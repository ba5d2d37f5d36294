use crate::oracle::ImproveRequest;

pub const IMPROVE_SYSTEM: &str = "You are a Python performance optimizer focused on minimizing CPU cycles and memory usage \
to reduce energy use and carbon emissions. Return ONLY the raw Python function code with no explanation, \
no markdown, and no imports unless strictly required. Keep the function's name and signature unchanged.";

pub const SPEC_SYSTEM: &str = "You are a Python test engineer. Return ONLY raw Python test functions with no imports, \
no module-level code, and no markdown. Each function name must start with 'test_'. \
Tests will be exec()'d in a namespace that already contains the function under test.";

/// User message for one improvement call.
///
/// The first attempt asks for an optimization outright; later attempts lead
/// with every earlier rejection reason so the model changes approach.
pub fn improve_user_prompt(request: &ImproveRequest<'_>) -> String {
    if request.feedback.is_empty() {
        format!(
            "Optimize this Python function `{}` to be more carbon-efficient \
             (fewer CPU operations, less memory):\n\n{}\n\nIt must pass these tests:\n{}",
            request.function_name, request.code, request.test_code
        )
    } else {
        format!(
            "Previous attempts failed for these reasons:\n{}\n\n\
             Try a different optimization approach for:\n\n{}\n\nIt must pass these tests:\n{}",
            request.feedback.bullets(),
            request.code,
            request.test_code
        )
    }
}

/// User message asking for tests, reusing an existing test file when one was given.
pub fn spec_user_prompt(name: &str, source: &str, existing_tests: Option<&str>) -> String {
    match existing_tests {
        Some(tests) => format!(
            "Here is a Python function:\n\n{source}\n\n\
             Here is an existing test file:\n\n{tests}\n\n\
             Extract all test_* functions from the test file that test '{name}'. \
             If none are found, generate a minimal set of correctness tests for this function. \
             Return ONLY raw Python test functions (no imports, no module-level code). \
             The tests will be exec()'d in a namespace that already contains the function."
        ),
        None => format!(
            "Here is a Python function:\n\n{source}\n\n\
             Generate a minimal set of correctness tests for '{name}'. \
             Return ONLY raw Python test functions (no imports, no module-level code). \
             The tests will be exec()'d in a namespace that already contains the function. \
             Each test function name must start with 'test_'."
        ),
    }
}
