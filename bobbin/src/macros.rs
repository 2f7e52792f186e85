/// Build the argument list of a thread function call
#[macro_export]
macro_rules! args {
    ($($arg:expr),* $(,)?) => {
        ::std::vec![$($crate::Value::from($arg)),*]
    };
}

/// Return early from a computation body with a formatted failure
#[macro_export]
macro_rules! fail {
    ($($fmt:tt)+) => {
        return ::std::result::Result::Err($crate::Signal::failure(::std::format!($($fmt)+)))
    };
}
