use colored::*;
use grillo_core::{
    Registry,
    prost_reflect::{MethodDescriptor, ServiceDescriptor},
};

/// A wrapper struct for a formatted, colored string.
///
/// Implements `Display` so it can be printed directly.
pub struct FormattedString(pub String);

/// Every service of a registry, with its methods.
pub struct ServiceList<'a>(pub &'a Registry);

/// Outcome of `grillo check`.
pub struct CheckReport {
    pub services: usize,
    pub methods: usize,
    /// Number of rules loaded, if a rule document was given.
    pub rules: Option<usize>,
}

impl std::fmt::Display for FormattedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f)?;
        writeln!(f, "{}", self.0)?;
        Ok(())
    }
}

impl From<anyhow::Error> for FormattedString {
    fn from(err: anyhow::Error) -> Self {
        let mut out = format!("{}", "Error:".red().bold());
        for cause in err.chain() {
            out.push_str(&format!("\n  {cause}"));
        }
        FormattedString(out)
    }
}

impl From<ServiceList<'_>> for FormattedString {
    fn from(ServiceList(registry): ServiceList<'_>) -> Self {
        if registry.is_empty() {
            return FormattedString("No services found.".yellow().to_string());
        }

        let services: Vec<_> = registry
            .services()
            .map(|service| FormattedString::from(service).0)
            .collect();
        FormattedString(services.join("\n\n"))
    }
}

impl From<ServiceDescriptor> for FormattedString {
    fn from(service: ServiceDescriptor) -> Self {
        let mut out = String::new();
        out.push_str(&format!(
            "{} {} {{\n",
            "service".cyan(),
            service.full_name().green()
        ));

        for method in service.methods() {
            out.push_str("  ");
            out.push_str(&FormattedString::from(method).0);
            out.push('\n');
        }
        out.push('}');
        FormattedString(out)
    }
}

impl From<MethodDescriptor> for FormattedString {
    fn from(method: MethodDescriptor) -> Self {
        let stream = |streaming: bool| match streaming {
            true => format!("{} ", "stream".cyan()),
            false => String::new(),
        };

        FormattedString(format!(
            "{} {}({}{}) {} ({}{});",
            "rpc".cyan(),
            method.name().green(),
            stream(method.is_client_streaming()),
            method.input().full_name().yellow(),
            "returns".cyan(),
            stream(method.is_server_streaming()),
            method.output().full_name().yellow()
        ))
    }
}

impl From<CheckReport> for FormattedString {
    fn from(report: CheckReport) -> Self {
        let mut out = format!(
            "{} {} services, {} methods",
            "Schema OK:".green().bold(),
            report.services,
            report.methods
        );

        match report.rules {
            Some(rules) => out.push_str(&format!("\n{} {} rules", "Rules OK:".green().bold(), rules)),
            None => out.push_str(&format!("\n{}", "No rule document given.".yellow())),
        }

        FormattedString(out)
    }
}
