/// Fallback prefix for threads the test harness did not name.
const NOT_FOUND: &str = "TestNameNotFound_";

/// A filesystem-friendly prefix naming the test running on the current thread.
///
/// libtest names each test thread after the test path (`module::test_name`), so this must be
/// called on the test's own thread, before any work moves onto runtime workers.
#[must_use]
pub fn current() -> String {
	std::thread::current()
		.name()
		.filter(|name| *name != "main" && !name.starts_with("tokio-runtime"))
		.map_or_else(|| NOT_FOUND.to_string(), sanitize)
}

fn sanitize(thread_name: &str) -> String {
	let mut namespace = thread_name
		.rsplit("::")
		.next()
		.unwrap_or(thread_name)
		.chars()
		.map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
		.collect::<String>();

	if namespace.is_empty() {
		return NOT_FOUND.to_string();
	}

	namespace.push('_');
	namespace
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn uses_the_test_thread_name() {
		// `--test-threads=1` may run us on the main thread
		let namespace = current();
		assert!(
			namespace == "uses_the_test_thread_name_" || namespace == NOT_FOUND,
			"{namespace}"
		);
	}

	#[test]
	fn keeps_only_the_last_path_segment() {
		assert_eq!(sanitize("server::tests::stop_twice"), "stop_twice_");
		assert_eq!(sanitize("weird name-here"), "weird_name_here_");
	}

	#[test]
	fn unnamed_threads_fall_back() {
		let namespace = std::thread::spawn(current).join().unwrap();
		assert_eq!(namespace, NOT_FOUND);
	}

	#[test]
	fn empty_names_fall_back() {
		assert_eq!(sanitize(""), NOT_FOUND);
		assert_eq!(sanitize("tests::"), NOT_FOUND);
	}
}
