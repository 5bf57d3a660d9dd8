//! Pseudo filter code (PFC) listing.
//!
//! A readable rendering of what the compiled program decides, one block per
//! architecture, rules in evaluation order.

use std::collections::BTreeMap;
use std::io::Write;

use crate::action::Action;
use crate::arch::Arch;
use crate::error::Result;
use crate::filter::Rule;

pub(crate) fn write<W: Write>(
    default_action: Action,
    bad_arch_action: Action,
    arches: &BTreeMap<Arch, Vec<Rule>>,
    mut out: W,
) -> Result<()> {
    writeln!(out, "#")?;
    writeln!(out, "# pseudo filter code start")?;
    writeln!(out, "#")?;

    for (arch, rules) in arches {
        writeln!(out, "# filter for arch {arch} ({})", arch.audit_value())?;
        writeln!(out, "if ($arch == {})", arch.audit_value())?;
        for rule in rules {
            let nr = rule.syscall();
            let name = nr.name_by_arch(*arch).unwrap_or("?");
            writeln!(out, "  # filter for syscall \"{name}\" ({})", nr.number())?;
            writeln!(out, "  if ($syscall == {})", nr.number())?;
            if rule.conditions().is_empty() {
                writeln!(out, "    action {};", rule.action())?;
            } else {
                let conds: Vec<String> = rule.conditions().iter().map(|c| c.to_string()).collect();
                writeln!(out, "    if ({})", conds.join(" && "))?;
                writeln!(out, "      action {};", rule.action())?;
            }
        }
        writeln!(out, "  # default action")?;
        writeln!(out, "  action {default_action};")?;
    }

    writeln!(out, "# invalid architecture action")?;
    writeln!(out, "action {bad_arch_action};")?;
    writeln!(out, "#")?;
    writeln!(out, "# pseudo filter code end")?;
    writeln!(out, "#")?;
    out.flush()?;
    Ok(())
}
